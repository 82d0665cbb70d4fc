pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;
pub mod validation;
pub mod workflow;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, RunOutcome};
pub use workflow::{Phase, PhaseState, WorkflowId};
