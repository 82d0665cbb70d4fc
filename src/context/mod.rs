//! Shared context: the append-only record of task outputs and its log.

mod entry;
mod log;
mod store;

pub use entry::{ContextEntry, EntryId, PHASE_KEY, TASK_KEY, WORKFLOW_KEY};
pub use log::{ContextLog, CONTEXT_LOG_FILE};
pub use store::{ContextStore, History};
