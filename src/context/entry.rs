//! Context entry data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Metadata, Role, TaskId};
use crate::workflow::WorkflowId;

/// Metadata key tying an entry to the workflow that produced it.
pub const WORKFLOW_KEY: &str = "workflow_id";
/// Metadata key tying an entry to the task whose output it records.
pub const TASK_KEY: &str = "task_id";
/// Metadata key recording the phase an entry was produced in.
pub const PHASE_KEY: &str = "phase";

/// Unique identifier for a context entry, assigned at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// An immutable record of one task output.
///
/// Entries are only created by [`ContextStore::store`](super::ContextStore::store)
/// and are shared by reference once visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: EntryId,
    /// Role that produced the payload.
    pub role: Role,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// Entries this one was derived from.
    #[serde(default)]
    pub dependencies: Vec<EntryId>,
    /// Insertion position in the store.
    pub seq: u64,
}

impl ContextEntry {
    pub fn workflow_id(&self) -> Option<WorkflowId> {
        self.metadata
            .get(WORKFLOW_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.metadata
            .get(TASK_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    pub fn depends_on(&self, other: EntryId) -> bool {
        self.dependencies.contains(&other)
    }
}
