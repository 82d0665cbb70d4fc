//! Core domain models: roles, tasks and the per-phase task graph.

pub mod dag;
pub mod task;

pub use dag::TaskDAG;
pub use task::{Priority, Role, Task, TaskId, TaskOutput};

/// Opaque string-keyed metadata carried by tasks and context entries.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
