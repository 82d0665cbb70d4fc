//! The validation gate: runs every applicable rule and combines the verdicts.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{TaskId, TaskOutput};
use crate::validation::rule::{MinimumLength, NonEmptyContent, NonEmptyOutputs, Rule, RuleScope};
use crate::workflow::Phase;
use crate::{clog_debug, clog_warn};

/// A failing rule, with enough context to route the failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Name of the rule that failed.
    pub rule: String,
    pub message: String,
    /// The task whose output failed, when the check ran on a single task.
    pub task: Option<TaskId>,
}

impl ValidationError {
    pub fn new(rule: &str, message: &str) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.to_string(),
            task: None,
        }
    }

    pub fn for_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// Combined verdict of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub phase: Phase,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    fn new(phase: Phase) -> Self {
        Self {
            passed: true,
            phase,
            errors: Vec::new(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
            validated_at: Utc::now(),
        }
    }

    /// One-line summary of every error, used as a retry failure note.
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            return "passed".to_string();
        }
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The tasks the errors point at, provided every error points at one.
    ///
    /// `None` when the verdict passed or any error concerns the set as a whole.
    pub fn blamed_tasks(&self) -> Option<Vec<TaskId>> {
        if self.errors.is_empty() {
            return None;
        }
        let mut tasks = Vec::new();
        for error in &self.errors {
            let task = error.task?;
            if !tasks.contains(&task) {
                tasks.push(task);
            }
        }
        Some(tasks)
    }

    /// Summary of the errors that point at `task`.
    pub fn summary_for(&self, task: TaskId) -> String {
        self.errors
            .iter()
            .filter(|e| e.task == Some(task))
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Evaluates phase outputs against the registered rules.
///
/// Rules registered with [`ValidationGate::add_rule`] apply to every phase;
/// [`ValidationGate::add_phase_rule`] scopes a rule to one phase.
#[derive(Clone, Default)]
pub struct ValidationGate {
    global: Vec<Arc<dyn Rule>>,
    per_phase: HashMap<Phase, Vec<Arc<dyn Rule>>>,
}

impl ValidationGate {
    /// A gate with no rules: every evaluation passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate with the built-in rules applied to every phase.
    pub fn with_default_rules() -> Self {
        let mut gate = Self::new();
        gate.add_rule(Arc::new(NonEmptyOutputs));
        gate.add_rule(Arc::new(NonEmptyContent));
        gate.add_rule(Arc::new(MinimumLength::default()));
        gate
    }

    pub fn add_rule(&mut self, rule: Arc<dyn Rule>) {
        self.global.push(rule);
    }

    pub fn add_phase_rule(&mut self, phase: Phase, rule: Arc<dyn Rule>) {
        self.per_phase.entry(phase).or_default().push(rule);
    }

    /// Number of rules that apply to a phase.
    pub fn rule_count(&self, phase: Phase) -> usize {
        self.global.len() + self.per_phase.get(&phase).map_or(0, Vec::len)
    }

    /// Evaluate all rules for `phase` against the phase's outputs.
    ///
    /// Every rule runs; the verdict fails if any rule fails. A rule that
    /// errors or panics is reported as a failure of that rule.
    pub fn evaluate(&self, phase: Phase, outputs: &[TaskOutput]) -> ValidationResult {
        self.run(phase, outputs, None)
    }

    /// Evaluate a single task's output against the output-scoped rules.
    ///
    /// Errors carry the task reference.
    pub fn evaluate_task(&self, phase: Phase, output: &TaskOutput) -> ValidationResult {
        let mut result = self.run(
            phase,
            std::slice::from_ref(output),
            Some(RuleScope::Output),
        );
        for error in &mut result.errors {
            error.task = Some(output.task_id);
        }
        result
    }

    fn run(
        &self,
        phase: Phase,
        outputs: &[TaskOutput],
        only: Option<RuleScope>,
    ) -> ValidationResult {
        let mut result = ValidationResult::new(phase);
        let phase_rules = self.per_phase.get(&phase).into_iter().flatten();
        let rules = self
            .global
            .iter()
            .chain(phase_rules)
            .filter(|rule| only.map_or(true, |scope| rule.scope() == scope));

        for rule in rules {
            let name = rule.name().to_string();
            let outcome = catch_unwind(AssertUnwindSafe(|| rule.evaluate(outputs)));

            match outcome {
                Ok(Ok(outcome)) => {
                    if let Some(suggestion) = outcome.suggestion {
                        result.suggestions.push(suggestion);
                    }
                    if outcome.passed {
                        if let Some(message) = outcome.message {
                            result.warnings.push(format!("[{}] {}", name, message));
                        }
                    } else {
                        let message = outcome
                            .message
                            .unwrap_or_else(|| "rule failed".to_string());
                        if outcome.tasks.is_empty() {
                            result.errors.push(ValidationError::new(&name, &message));
                        }
                        for task in outcome.tasks {
                            result
                                .errors
                                .push(ValidationError::new(&name, &message).for_task(task));
                        }
                    }
                }
                Ok(Err(reason)) => {
                    clog_warn!("Rule {} could not run: {}", name, reason);
                    result.errors.push(ValidationError::new(
                        &name,
                        &format!("rule failed to execute: {}", reason),
                    ));
                }
                Err(_) => {
                    clog_warn!("Rule {} panicked", name);
                    result
                        .errors
                        .push(ValidationError::new(&name, "rule panicked during evaluation"));
                }
            }
        }

        result.passed = result.errors.is_empty();
        clog_debug!(
            "Gate phase={} outputs={} errors={} warnings={}",
            phase,
            outputs.len(),
            result.errors.len(),
            result.warnings.len()
        );
        result
    }
}

impl std::fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationGate")
            .field("global_rules", &self.global.len())
            .field("phase_rules", &self.per_phase.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
