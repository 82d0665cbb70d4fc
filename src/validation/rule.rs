//! Rules evaluated by the validation gate, and the built-in rule set.

use crate::core::{TaskId, TaskOutput};

/// What a rule concluded about a set of outputs.
///
/// A passing outcome with a message is a warning; a failing outcome's
/// message becomes the error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub passed: bool,
    pub message: Option<String>,
    pub suggestion: Option<String>,
    /// Tasks whose outputs caused the failure. Empty when the set as a whole
    /// is at fault.
    pub tasks: Vec<TaskId>,
}

impl RuleOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: None,
            suggestion: None,
            tasks: Vec::new(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: Some(message.into()),
            suggestion: None,
            tasks: Vec::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
            suggestion: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Pin the failure on specific tasks so they can be retried on their own.
    pub fn for_tasks(mut self, tasks: impl IntoIterator<Item = TaskId>) -> Self {
        self.tasks.extend(tasks);
        self
    }
}

/// What a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RuleScope {
    /// Judges each output on its own; also checked per task before storing.
    #[default]
    Output,
    /// Judges the phase's outputs as a set; only checked when advancing.
    Phase,
}

/// A validation rule.
///
/// Rules must be independent of one another: the gate may evaluate them in
/// any order. Returning `Err` means the rule could not run, which the gate
/// records as a failure of that rule.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    fn scope(&self) -> RuleScope {
        RuleScope::Output
    }

    fn evaluate(&self, outputs: &[TaskOutput]) -> std::result::Result<RuleOutcome, String>;
}

/// Text carried by a payload: the string itself, or a `content` field.
pub fn payload_text(payload: &serde_json::Value) -> Option<&str> {
    match payload {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Object(map) => map.get("content").and_then(|c| c.as_str()),
        _ => None,
    }
}

/// Rejects a phase that produced no outputs at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonEmptyOutputs;

impl Rule for NonEmptyOutputs {
    fn name(&self) -> &str {
        "non_empty_outputs"
    }

    fn scope(&self) -> RuleScope {
        RuleScope::Phase
    }

    fn evaluate(&self, outputs: &[TaskOutput]) -> std::result::Result<RuleOutcome, String> {
        if outputs.is_empty() {
            Ok(RuleOutcome::fail("NO_OUTPUT: no outputs generated for phase"))
        } else {
            Ok(RuleOutcome::pass())
        }
    }
}

/// Rejects null payloads and blank text.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonEmptyContent;

impl Rule for NonEmptyContent {
    fn name(&self) -> &str {
        "non_empty_content"
    }

    fn evaluate(&self, outputs: &[TaskOutput]) -> std::result::Result<RuleOutcome, String> {
        let empty: Vec<String> = outputs
            .iter()
            .filter(|o| {
                o.payload.is_null() || payload_text(&o.payload).is_some_and(|t| t.trim().is_empty())
            })
            .map(|o| o.role.to_string())
            .collect();

        if empty.is_empty() {
            Ok(RuleOutcome::pass())
        } else {
            Ok(RuleOutcome::fail(format!(
                "EMPTY_OUTPUT: output is empty ({})",
                empty.join(", ")
            ))
            .with_suggestion("Re-run the task with the failure notes attached"))
        }
    }
}

/// Flags, without rejecting, text output shorter than a minimum length.
#[derive(Debug, Clone, Copy)]
pub struct MinimumLength {
    pub min_chars: usize,
}

impl Default for MinimumLength {
    fn default() -> Self {
        Self { min_chars: 50 }
    }
}

impl Rule for MinimumLength {
    fn name(&self) -> &str {
        "minimum_length"
    }

    fn evaluate(&self, outputs: &[TaskOutput]) -> std::result::Result<RuleOutcome, String> {
        let short = outputs.iter().any(|o| {
            payload_text(&o.payload)
                .is_some_and(|t| !t.trim().is_empty() && t.chars().count() < self.min_chars)
        });

        if short {
            Ok(RuleOutcome::warn(
                "Output seems very short, may be incomplete",
            ))
        } else {
            Ok(RuleOutcome::pass())
        }
    }
}

type RuleFn = dyn Fn(&[TaskOutput]) -> std::result::Result<RuleOutcome, String> + Send + Sync;

/// A rule backed by a closure.
pub struct FnRule {
    name: String,
    scope: RuleScope,
    check: Box<RuleFn>,
}

impl FnRule {
    pub fn new<F>(name: &str, check: F) -> Self
    where
        F: Fn(&[TaskOutput]) -> std::result::Result<RuleOutcome, String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            scope: RuleScope::Output,
            check: Box::new(check),
        }
    }

    /// A closure rule over the whole output set of a phase.
    pub fn phase<F>(name: &str, check: F) -> Self
    where
        F: Fn(&[TaskOutput]) -> std::result::Result<RuleOutcome, String> + Send + Sync + 'static,
    {
        Self {
            scope: RuleScope::Phase,
            ..Self::new(name, check)
        }
    }
}

impl Rule for FnRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> RuleScope {
        self.scope
    }

    fn evaluate(&self, outputs: &[TaskOutput]) -> std::result::Result<RuleOutcome, String> {
        (self.check)(outputs)
    }
}

impl std::fmt::Debug for FnRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnRule")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish()
    }
}
