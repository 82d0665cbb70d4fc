//! File-backed persistence for workflow instances.
//!
//! Each workflow is one JSON document; writes are atomic so an interrupted
//! run can always be resumed from its last committed transition.

mod manager;

pub use manager::WorkflowStore;
