//! Task data model.
//!
//! Tasks are the units of work handed to an executor within a phase. A task
//! is built by the orchestrator when a phase is entered and is never mutated
//! after dispatch; a retry dispatches a copy carrying the failure notes of
//! previous attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::EntryId;
use crate::core::Metadata;
use crate::workflow::Phase;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The specialised role an executor plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ProductAnalyst,
    Architect,
    Developer,
    Debugger,
    CodeReviewer,
    DataScientist,
    AiEngineer,
    MlEngineer,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::ProductAnalyst,
        Role::Architect,
        Role::Developer,
        Role::Debugger,
        Role::CodeReviewer,
        Role::DataScientist,
        Role::AiEngineer,
        Role::MlEngineer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ProductAnalyst => "product_analyst",
            Role::Architect => "architect",
            Role::Developer => "developer",
            Role::Debugger => "debugger",
            Role::CodeReviewer => "code_reviewer",
            Role::DataScientist => "data_scientist",
            Role::AiEngineer => "ai_engineer",
            Role::MlEngineer => "ml_engineer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("unknown role: {}", s))
    }
}

/// Task priority levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// A unit of work dispatched to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Role whose executor runs the task.
    pub role: Role,
    /// Phase the task belongs to.
    pub phase: Phase,
    /// Free-form description of the work.
    pub description: String,
    /// Context entries the executor must see, in order.
    pub required_context: Vec<EntryId>,
    /// Sibling tasks in the same phase that must finish first.
    #[serde(default)]
    pub after: Vec<TaskId>,
    pub priority: Priority,
    #[serde(default)]
    pub metadata: Metadata,
    /// Summaries of earlier failed attempts, oldest first.
    #[serde(default)]
    pub failure_notes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task for a role in a phase with medium priority.
    pub fn new(role: Role, phase: Phase, description: &str) -> Self {
        Self {
            id: TaskId::new(),
            role,
            phase,
            description: description.to_string(),
            required_context: Vec::new(),
            after: Vec::new(),
            priority: Priority::default(),
            metadata: Metadata::new(),
            failure_notes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, entries: Vec<EntryId>) -> Self {
        self.required_context = entries;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Declare that this task waits for a sibling task.
    pub fn after(mut self, sibling: TaskId) -> Self {
        if !self.after.contains(&sibling) {
            self.after.push(sibling);
        }
        self
    }

    /// Copy of this task for a retry, carrying the failure summaries so far.
    ///
    /// The copy keeps the same identifier so retry accounting follows the task.
    pub fn retry_with(&self, failure_notes: &[String]) -> Self {
        let mut task = self.clone();
        task.failure_notes = failure_notes.to_vec();
        task
    }

    /// Whether this dispatch is a retry of an earlier failed attempt.
    pub fn is_retry(&self) -> bool {
        !self.failure_notes.is_empty()
    }
}

/// What one dispatch of a task produced.
///
/// The payload is opaque to the core; only rules look inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub role: Role,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TaskOutput {
    pub fn new(task_id: TaskId, role: Role, payload: serde_json::Value) -> Self {
        Self {
            task_id,
            role,
            payload,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}
