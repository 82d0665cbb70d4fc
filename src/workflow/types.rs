//! Core workflow type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::TaskId;

/// Unique identifier for a workflow instance.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new unique workflow identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A named stage in a workflow's phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analysis,
    Architecture,
    Implementation,
    Debugging,
    Review,
    Deployment,
    DataAnalysis,
    FeatureEngineering,
    ModelDevelopment,
    ModelTraining,
    ModelEvaluation,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::Analysis,
        Phase::Architecture,
        Phase::Implementation,
        Phase::Debugging,
        Phase::Review,
        Phase::Deployment,
        Phase::DataAnalysis,
        Phase::FeatureEngineering,
        Phase::ModelDevelopment,
        Phase::ModelTraining,
        Phase::ModelEvaluation,
    ];

    /// The software-delivery sequence used when no phases are configured.
    pub const DEFAULT_SEQUENCE: [Phase; 5] = [
        Phase::Analysis,
        Phase::Architecture,
        Phase::Implementation,
        Phase::Debugging,
        Phase::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Analysis => "analysis",
            Phase::Architecture => "architecture",
            Phase::Implementation => "implementation",
            Phase::Debugging => "debugging",
            Phase::Review => "review",
            Phase::Deployment => "deployment",
            Phase::DataAnalysis => "data_analysis",
            Phase::FeatureEngineering => "feature_engineering",
            Phase::ModelDevelopment => "model_development",
            Phase::ModelTraining => "model_training",
            Phase::ModelEvaluation => "model_evaluation",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| format!("unknown phase: {}", s))
    }
}

/// Where a workflow currently stands: in a configured phase or terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "phase")]
pub enum PhaseState {
    Active(Phase),
    Completed,
    Abandoned,
}

impl PhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseState::Completed | PhaseState::Abandoned)
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            PhaseState::Active(phase) => Some(*phase),
            _ => None,
        }
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseState::Active(phase) => write!(f, "{}", phase),
            PhaseState::Completed => write!(f, "completed"),
            PhaseState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Status of a workflow in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but no phase has been dispatched yet.
    #[default]
    Pending,
    Running,
    /// Running again after the most recent rollback.
    RolledBack,
    Completed,
    /// Terminal failure awaiting manual action.
    Abandoned,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Abandoned)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::RolledBack => write!(f, "rolled_back"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// How a recorded transition came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// Phase outputs passed the gate.
    Accepted,
    /// Explicit, counted rollback.
    RolledBack,
    /// Rollback budget exhausted.
    RollbackExhausted,
    /// Aborted by the caller.
    Aborted,
}

impl std::fmt::Display for TransitionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionOutcome::Accepted => write!(f, "accepted"),
            TransitionOutcome::RolledBack => write!(f, "rolled_back"),
            TransitionOutcome::RollbackExhausted => write!(f, "rollback_exhausted"),
            TransitionOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// A record of a phase transition with timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: PhaseState,
    pub outcome: TransitionOutcome,
    pub at: DateTime<Utc>,
}

/// What kind of recovery decision was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Retry,
    Escalate,
    Rollback,
    Abort,
    Abandon,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionKind::Retry => write!(f, "retry"),
            DecisionKind::Escalate => write!(f, "escalate"),
            DecisionKind::Rollback => write!(f, "rollback"),
            DecisionKind::Abort => write!(f, "abort"),
            DecisionKind::Abandon => write!(f, "abandon"),
        }
    }
}

/// A recovery decision recorded against a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub phase: Option<Phase>,
    pub task: Option<TaskId>,
    pub rationale: String,
    pub at: DateTime<Utc>,
}

impl Decision {
    pub fn new(kind: DecisionKind, phase: Option<Phase>, rationale: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            task: None,
            rationale: rationale.into(),
            at: Utc::now(),
        }
    }

    pub fn for_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }
}

/// Granularity of the rollback counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// One budget shared by every rollback of the workflow.
    #[default]
    PerWorkflow,
    /// A separate budget for each rollback target phase.
    PerPhase,
}
