//! Workflow lifecycle: phases, instances and the gated state machine.

mod instance;
mod state;
mod types;

pub use instance::{WorkflowInstance, WorkflowSummary};
pub use state::{AdvanceOutcome, WorkflowStateMachine, DEFAULT_MAX_ROLLBACKS};
pub use types::{
    Decision, DecisionKind, Phase, PhaseState, PhaseTransition, RollbackPolicy,
    TransitionOutcome, WorkflowId, WorkflowStatus,
};
