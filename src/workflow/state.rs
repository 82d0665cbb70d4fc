//! Workflow state machine with validation-gated transitions.
//!
//! `WorkflowStateMachine` owns every live [`WorkflowInstance`] and is the
//! only place their phase changes. Phases move forward one step at a time
//! when the [`ValidationGate`] accepts a phase's outputs, and backward only
//! through a counted [`WorkflowStateMachine::rollback`]. COMPLETED and
//! ABANDONED are terminal.
//!
//! A rejected phase is reported as [`AdvanceOutcome::Rejected`], never as an
//! error, so callers decide between retrying and rolling back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::{TaskId, TaskOutput};
use crate::error::{Error, Result};
use crate::state::WorkflowStore;
use crate::validation::{ValidationGate, ValidationResult};
use crate::{clog, clog_debug, clog_error, clog_warn};

use super::instance::{WorkflowInstance, WorkflowSummary};
use super::types::{
    Decision, DecisionKind, Phase, PhaseState, PhaseTransition, RollbackPolicy, TransitionOutcome,
    WorkflowId, WorkflowStatus,
};

/// Rollbacks allowed before a workflow is abandoned.
pub const DEFAULT_MAX_ROLLBACKS: u32 = 3;

/// Result of submitting a phase's outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// Outputs accepted; the workflow moved to this state.
    Accepted(PhaseState),
    /// Outputs rejected; the workflow did not move.
    Rejected(ValidationResult),
}

impl AdvanceOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AdvanceOutcome::Accepted(_))
    }
}

pub struct WorkflowStateMachine {
    instances: HashMap<WorkflowId, WorkflowInstance>,
    gate: Arc<ValidationGate>,
    store: Option<WorkflowStore>,
    max_rollbacks: u32,
    policy: RollbackPolicy,
}

impl WorkflowStateMachine {
    /// An in-memory state machine with the default rollback budget.
    pub fn new(gate: Arc<ValidationGate>) -> Self {
        Self {
            instances: HashMap::new(),
            gate,
            store: None,
            max_rollbacks: DEFAULT_MAX_ROLLBACKS,
            policy: RollbackPolicy::default(),
        }
    }

    pub fn with_rollback_limit(mut self, max_rollbacks: u32, policy: RollbackPolicy) -> Self {
        self.max_rollbacks = max_rollbacks;
        self.policy = policy;
        self
    }

    /// Persist every transition through `store`.
    pub fn with_store(mut self, store: WorkflowStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Create a workflow positioned at the first of `phases`.
    ///
    /// # Errors
    /// Returns `Error::Config` for an empty or repeating phase list.
    pub fn start(&mut self, phases: Vec<Phase>) -> Result<WorkflowId> {
        if phases.is_empty() {
            return Err(Error::Config("workflow needs at least one phase".to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = phases.iter().find(|p| !seen.insert(**p)) {
            return Err(Error::Config(format!("phase {} listed twice", dup)));
        }

        let instance = WorkflowInstance::new(phases, self.policy);
        let id = instance.id;
        self.persist(&instance)?;
        clog!(
            "Workflow {} started: {}",
            id.short(),
            instance
                .phases
                .iter()
                .map(Phase::as_str)
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        self.instances.insert(id, instance);
        Ok(id)
    }

    /// Load a persisted workflow so it can be driven again.
    ///
    /// Returns the loaded workflow's current state. Loading a workflow that
    /// is already in memory is a no-op.
    pub fn load(&mut self, id: WorkflowId) -> Result<PhaseState> {
        if let Some(instance) = self.instances.get(&id) {
            return Ok(instance.state);
        }
        let store = self.store.as_ref().ok_or(Error::WorkflowNotFound(id))?;
        let instance = store.load(id)?;
        let state = instance.state;
        clog_debug!("Workflow {} loaded at {}", id.short(), state);
        self.instances.insert(id, instance);
        Ok(state)
    }

    /// Submit the active phase's outputs to the validation gate.
    ///
    /// On accept the workflow moves to the next configured phase, or to
    /// COMPLETED after the last one. On reject nothing changes.
    ///
    /// # Errors
    /// `WorkflowNotFound`, or `InvalidTransition` from a terminal state.
    /// A failed write leaves the workflow where it was.
    pub fn advance(&mut self, id: WorkflowId, outputs: &[TaskOutput]) -> Result<AdvanceOutcome> {
        self.refresh(id)?;
        let instance = self.active_instance(id, "next phase")?;
        let phase = self.current_active(instance)?;

        let result = self.gate.evaluate(phase, outputs);
        if !result.passed {
            clog_warn!(
                "Workflow {} phase {} rejected: {}",
                id.short(),
                phase,
                result.summary()
            );
            return Ok(AdvanceOutcome::Rejected(result));
        }

        let next = self.apply(id, |instance| {
            let next_index = instance.phase_index + 1;
            let next = match instance.phases.get(next_index) {
                Some(next) => {
                    instance.phase_index = next_index;
                    PhaseState::Active(*next)
                }
                None => PhaseState::Completed,
            };
            instance.record(phase, next, TransitionOutcome::Accepted);
            instance.status = if next == PhaseState::Completed {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Running
            };
            next
        })?;

        clog!("Workflow {} advanced {} -> {}", id.short(), phase, next);
        Ok(AdvanceOutcome::Accepted(next))
    }

    /// Move the workflow back to `target`, an earlier or the current phase.
    ///
    /// Each rollback is charged against the budget selected by the rollback
    /// policy. Once the budget is spent the workflow is abandoned.
    ///
    /// # Errors
    /// `InvalidTransition` for a terminal workflow or a target that is not an
    /// earlier configured phase; `RollbackExhausted` once the budget is spent.
    pub fn rollback(&mut self, id: WorkflowId, target: Phase) -> Result<PhaseState> {
        self.refresh(id)?;
        let instance = self.active_instance(id, target.as_str())?;
        let from = self.current_active(instance)?;
        let target_index = instance
            .phases
            .iter()
            .position(|p| *p == target)
            .filter(|&i| i <= instance.phase_index)
            .ok_or_else(|| Error::InvalidTransition {
                workflow: id,
                from: from.to_string(),
                to: target.to_string(),
            })?;

        let max = self.max_rollbacks;
        if instance.rollbacks_charged(target) >= max {
            self.apply(id, |instance| {
                instance.status = WorkflowStatus::Abandoned;
                instance.record(
                    from,
                    PhaseState::Abandoned,
                    TransitionOutcome::RollbackExhausted,
                );
                instance.record_decision(Decision::new(
                    DecisionKind::Abandon,
                    Some(from),
                    format!("rollback to {} refused: limit of {} reached", target, max),
                ));
            })?;
            clog_warn!(
                "Workflow {} abandoned: rollback limit {} exhausted",
                id.short(),
                max
            );
            return Err(Error::RollbackExhausted { workflow: id, max });
        }

        self.apply(id, |instance| {
            instance.total_rollbacks += 1;
            *instance.rollbacks_by_phase.entry(target).or_insert(0) += 1;
            instance.phase_index = target_index;
            instance.status = WorkflowStatus::RolledBack;
            instance.record(from, PhaseState::Active(target), TransitionOutcome::RolledBack);
            let count = instance.total_rollbacks;
            instance.record_decision(Decision::new(
                DecisionKind::Rollback,
                Some(from),
                format!("rolled back to {} ({} of {})", target, count, max),
            ));
        })?;

        clog!("Workflow {} rolled back {} -> {}", id.short(), from, target);
        Ok(PhaseState::Active(target))
    }

    /// Mark a pending or rolled-back workflow as running.
    pub fn mark_running(&mut self, id: WorkflowId) -> Result<()> {
        self.refresh(id)?;
        if self.instance(id)?.status == WorkflowStatus::Pending {
            self.apply(id, |instance| instance.status = WorkflowStatus::Running)?;
        }
        Ok(())
    }

    /// End the workflow as ABANDONED at the caller's request.
    pub fn abort(&mut self, id: WorkflowId, rationale: &str) -> Result<()> {
        self.refresh(id)?;
        let instance = self.active_instance(id, "abandoned")?;
        let from = self.current_active(instance)?;

        self.apply(id, |instance| {
            instance.status = WorkflowStatus::Abandoned;
            instance.record(from, PhaseState::Abandoned, TransitionOutcome::Aborted);
            instance.record_decision(Decision::new(DecisionKind::Abort, Some(from), rationale));
        })?;
        clog_warn!("Workflow {} aborted: {}", id.short(), rationale);
        Ok(())
    }

    /// Record a retry or escalation decision without changing phase.
    pub fn record_decision(&mut self, id: WorkflowId, decision: Decision) -> Result<()> {
        self.refresh(id)?;
        self.apply(id, |instance| instance.record_decision(decision))
    }

    /// Pick up a terminal record another process wrote for this workflow.
    ///
    /// Returns the workflow's state afterwards. In-memory workflows have no
    /// other source and are returned as they are.
    pub fn refresh(&mut self, id: WorkflowId) -> Result<PhaseState> {
        let instance = self.instance(id)?;
        let state = instance.state;
        if instance.is_terminal() {
            return Ok(state);
        }
        let archived = match &self.store {
            Some(store) => store.archived(id)?,
            None => None,
        };
        let Some(archived) = archived else {
            return Ok(state);
        };

        let finished = archived.state;
        clog_warn!(
            "Workflow {} was finished elsewhere as {}",
            id.short(),
            finished
        );
        self.instances.insert(id, archived);
        Ok(finished)
    }

    /// Convenience for recording a decision about one task.
    pub fn record_task_decision(
        &mut self,
        id: WorkflowId,
        kind: DecisionKind,
        task: TaskId,
        rationale: &str,
    ) -> Result<()> {
        let phase = self.current_phase(id)?.phase();
        self.record_decision(id, Decision::new(kind, phase, rationale).for_task(task))
    }

    /// The workflow's current state. Pure read.
    pub fn current_phase(&self, id: WorkflowId) -> Result<PhaseState> {
        Ok(self.instance(id)?.state)
    }

    pub fn history(&self, id: WorkflowId) -> Result<&[PhaseTransition]> {
        Ok(&self.instance(id)?.history)
    }

    pub fn decisions(&self, id: WorkflowId) -> Result<&[Decision]> {
        Ok(&self.instance(id)?.decisions)
    }

    pub fn status(&self, id: WorkflowId) -> Result<WorkflowSummary> {
        Ok(self.instance(id)?.summary())
    }

    pub fn instance(&self, id: WorkflowId) -> Result<&WorkflowInstance> {
        self.instances.get(&id).ok_or(Error::WorkflowNotFound(id))
    }


    /// The instance, provided it can still transition.
    fn active_instance(&self, id: WorkflowId, to: &str) -> Result<&WorkflowInstance> {
        let instance = self.instance(id)?;
        if instance.is_terminal() {
            return Err(Error::InvalidTransition {
                workflow: id,
                from: instance.state.to_string(),
                to: to.to_string(),
            });
        }
        Ok(instance)
    }

    fn current_active(&self, instance: &WorkflowInstance) -> Result<Phase> {
        instance.state.phase().ok_or_else(|| Error::InvalidTransition {
            workflow: instance.id,
            from: instance.state.to_string(),
            to: "next phase".to_string(),
        })
    }

    fn persist(&self, instance: &WorkflowInstance) -> Result<()> {
        match &self.store {
            Some(store) if instance.is_terminal() => store.archive(instance),
            Some(store) => store.save(instance),
            None => Ok(()),
        }
    }

    /// Apply `change` to a copy of the workflow and swap it in once the copy
    /// is persisted. On a failed write the workflow is left untouched.
    fn apply<T>(
        &mut self,
        id: WorkflowId,
        change: impl FnOnce(&mut WorkflowInstance) -> T,
    ) -> Result<T> {
        let mut next = self.instance(id)?.clone();
        let value = change(&mut next);
        if let Err(e) = self.persist(&next) {
            clog_error!("Workflow {} not persisted, change dropped: {}", id.short(), e);
            return Err(e);
        }
        self.instances.insert(id, next);
        Ok(value)
    }
}

impl std::fmt::Debug for WorkflowStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStateMachine")
            .field("workflows", &self.instances.len())
            .field("max_rollbacks", &self.max_rollbacks)
            .field("policy", &self.policy)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
