use std::time::Duration;

use thiserror::Error;

use crate::context::EntryId;
use crate::core::{Role, TaskId};
use crate::validation::ValidationError;
use crate::workflow::WorkflowId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Unknown dependency: {dependency}")]
    UnknownDependency { dependency: EntryId },

    #[error("Writing entry {entry} would create a dependency cycle")]
    CyclicDependency { entry: EntryId },

    #[error("Context entry already exists: {0}")]
    DuplicateEntry(EntryId),

    #[error("Context store is in use by {workflows} workflow(s)")]
    StoreInUse { workflows: usize },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Invalid phase transition for workflow {workflow} from {from} to {to}")]
    InvalidTransition {
        workflow: WorkflowId,
        from: String,
        to: String,
    },

    #[error("Rollback limit of {max} exhausted for workflow {workflow}")]
    RollbackExhausted { workflow: WorkflowId, max: u32 },

    #[error("Executor unavailable for task {task} after {attempts} attempt(s): {reason}")]
    ExecutorUnavailable {
        task: TaskId,
        attempts: u32,
        reason: String,
    },

    #[error("Validation failed with {} error(s)", errors.len())]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Retries already exhausted for task {0}")]
    RetryExhausted(TaskId),

    #[error("Task {task} escalated for manual resolution after {attempts} attempt(s)")]
    Escalate { task: TaskId, attempts: u32 },

    #[error("No executor bound for role {0}")]
    UnknownRole(Role),

    #[error("Executor command not found: {0}")]
    ExecutorNotFound(String),

    #[error("Task graph error: {0}")]
    TaskGraph(String),
}

pub type Result<T> = std::result::Result<T, Error>;
