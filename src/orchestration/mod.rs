//! Orchestration layer: executors, retries and the workflow driver.
//!
//! The [`Orchestrator`] dispatches each phase's tasks to the [`Executor`]
//! bound to their role, validates what comes back, and drives the workflow
//! state machine forward or back.

mod command;
mod executor;
mod orchestrator;
mod retry;

pub use command::CommandExecutor;
pub use executor::{Executor, ExecutorBindings, ExecutorError, ExecutorRegistry};
pub use orchestrator::{Orchestrator, OrchestratorEvent, RunOutcome, ATTEMPTS_KEY};
pub use retry::{RetryController, RetryDecision, RetryState, DEFAULT_MAX_ATTEMPTS};
