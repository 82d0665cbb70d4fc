//! The persisted record of one workflow run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{
    Decision, Phase, PhaseState, PhaseTransition, RollbackPolicy, TransitionOutcome, WorkflowId,
    WorkflowStatus,
};

/// One workflow run: its phase sequence, position, and everything that
/// happened to it.
///
/// Only the state machine mutates an instance; it is saved after every
/// transition and archived once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    /// Configured phase sequence, fixed at start.
    pub phases: Vec<Phase>,
    /// Index into `phases` of the active phase.
    pub phase_index: usize,
    pub state: PhaseState,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub history: Vec<PhaseTransition>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub rollback_policy: RollbackPolicy,
    /// Every rollback performed, across all phases.
    #[serde(default)]
    pub total_rollbacks: u32,
    /// Rollbacks performed per target phase.
    #[serde(default)]
    pub rollbacks_by_phase: BTreeMap<Phase, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// A new instance positioned at the first phase.
    ///
    /// Callers check that `phases` is non-empty.
    pub(crate) fn new(phases: Vec<Phase>, policy: RollbackPolicy) -> Self {
        let now = Utc::now();
        let state = phases
            .first()
            .map(|p| PhaseState::Active(*p))
            .unwrap_or(PhaseState::Completed);
        Self {
            id: WorkflowId::new(),
            phases,
            phase_index: 0,
            state,
            status: WorkflowStatus::Pending,
            history: Vec::new(),
            decisions: Vec::new(),
            rollback_policy: policy,
            total_rollbacks: 0,
            rollbacks_by_phase: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_phase(&self) -> PhaseState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the workflow ended through an abort rather than a spent
    /// rollback budget.
    pub fn was_aborted(&self) -> bool {
        self.history
            .last()
            .is_some_and(|t| t.outcome == TransitionOutcome::Aborted)
    }

    pub fn rollback_count(&self) -> u32 {
        self.total_rollbacks
    }

    pub fn rollbacks_for(&self, phase: Phase) -> u32 {
        self.rollbacks_by_phase.get(&phase).copied().unwrap_or(0)
    }

    /// Rollbacks already charged against the budget for a target phase.
    pub(crate) fn rollbacks_charged(&self, target: Phase) -> u32 {
        match self.rollback_policy {
            RollbackPolicy::PerWorkflow => self.total_rollbacks,
            RollbackPolicy::PerPhase => self.rollbacks_for(target),
        }
    }

    /// Phases whose outputs were accepted, in the order they were accepted.
    ///
    /// A phase accepted again after a rollback appears once.
    pub fn completed_phases(&self) -> Vec<Phase> {
        let mut phases = Vec::new();
        for transition in &self.history {
            if transition.outcome == TransitionOutcome::Accepted
                && !phases.contains(&transition.from)
            {
                phases.push(transition.from);
            }
        }
        phases
    }

    /// Phases that were left through a rollback or abandonment.
    pub fn failed_phases(&self) -> Vec<Phase> {
        let mut phases = Vec::new();
        for transition in &self.history {
            let failed = matches!(
                transition.outcome,
                TransitionOutcome::RolledBack
                    | TransitionOutcome::RollbackExhausted
                    | TransitionOutcome::Aborted
            );
            if failed && !phases.contains(&transition.from) {
                phases.push(transition.from);
            }
        }
        phases
    }

    pub(crate) fn record(&mut self, from: Phase, to: PhaseState, outcome: TransitionOutcome) {
        let now = Utc::now();
        self.history.push(PhaseTransition {
            from,
            to,
            outcome,
            at: now,
        });
        self.state = to;
        self.updated_at = now;
    }

    pub(crate) fn record_decision(&mut self, decision: Decision) {
        self.updated_at = decision.at;
        self.decisions.push(decision);
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            status: self.status,
            state: self.state,
            completed_phases: self.completed_phases(),
            rollback_count: self.total_rollbacks,
            transitions: self.history.len(),
            decisions: self.decisions.len(),
            updated_at: self.updated_at,
        }
    }
}

/// Condensed view of a workflow for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub status: WorkflowStatus,
    pub state: PhaseState,
    pub completed_phases: Vec<Phase>,
    pub rollback_count: u32,
    pub transitions: usize,
    pub decisions: usize,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Display for WorkflowSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let completed: Vec<&str> = self.completed_phases.iter().map(Phase::as_str).collect();
        write!(
            f,
            "{} {} phase={} completed=[{}] rollbacks={}",
            self.id.short(),
            self.status,
            self.state,
            completed.join(", "),
            self.rollback_count
        )
    }
}
