//! Bounded retry and escalation for tasks whose output fails validation.
//!
//! The controller only counts content failures. Transport failures are
//! retried by the orchestrator first and reach the controller as a single
//! failure once that budget is spent.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::TaskId;
use crate::error::{Error, Result};

/// Attempts a task gets before it is escalated for manual resolution.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Failure history of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub task_id: TaskId,
    pub attempt_count: u32,
    /// One summary per failed attempt, oldest first.
    pub failures: Vec<String>,
}

impl RetryState {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            attempt_count: 0,
            failures: Vec::new(),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dispatch the task again, attaching the failure notes.
    Retry {
        attempt: u32,
        failure_notes: Vec<String>,
    },
    /// Stop retrying; the task needs manual resolution.
    Escalate(RetryState),
}

/// Tracks [`RetryState`] per task.
///
/// # Example
///
/// ```
/// use conductor::core::TaskId;
/// use conductor::orchestration::{RetryController, RetryDecision};
///
/// let mut retries = RetryController::new();
/// let task = TaskId::new();
///
/// assert!(matches!(retries.record_failure(task, "EMPTY_OUTPUT").unwrap(), RetryDecision::Retry { attempt: 1, .. }));
/// assert!(matches!(retries.record_failure(task, "EMPTY_OUTPUT").unwrap(), RetryDecision::Retry { attempt: 2, .. }));
/// assert!(matches!(retries.record_failure(task, "EMPTY_OUTPUT").unwrap(), RetryDecision::Escalate(_)));
/// ```
#[derive(Debug, Clone)]
pub struct RetryController {
    max_attempts: u32,
    states: HashMap<TaskId, RetryState>,
    /// Final tallies of tasks whose output was accepted, kept until the
    /// phase is settled in case a phase rule rejects that output.
    settled: HashMap<TaskId, RetryState>,
    escalated: HashSet<TaskId>,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryController {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            states: HashMap::new(),
            settled: HashMap::new(),
            escalated: HashSet::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record a failed attempt and decide whether to retry.
    ///
    /// A task whose accepted output is rejected later continues from its
    /// final tally, with the accepted attempt now counted as failed.
    /// Escalation is returned exactly once per task; its state is discarded.
    ///
    /// # Errors
    /// `RetryExhausted` if the task was already escalated.
    pub fn record_failure(&mut self, task_id: TaskId, summary: &str) -> Result<RetryDecision> {
        if self.escalated.contains(&task_id) {
            return Err(Error::RetryExhausted(task_id));
        }

        let settled = &mut self.settled;
        let state = self.states.entry(task_id).or_insert_with(|| {
            settled
                .remove(&task_id)
                .map(|mut reopened| {
                    reopened.attempt_count = reopened.attempt_count.saturating_sub(1);
                    reopened
                })
                .unwrap_or_else(|| RetryState::new(task_id))
        });
        state.attempt_count += 1;
        state.failures.push(summary.to_string());

        if state.attempt_count >= self.max_attempts {
            let state = self
                .states
                .remove(&task_id)
                .unwrap_or_else(|| RetryState::new(task_id));
            self.escalated.insert(task_id);
            return Ok(RetryDecision::Escalate(state));
        }

        Ok(RetryDecision::Retry {
            attempt: state.attempt_count,
            failure_notes: state.failures.clone(),
        })
    }

    /// Record a successful attempt.
    ///
    /// Returns the final tally, counting the successful attempt. The tally is
    /// kept until [`RetryController::forget`] so a later rejection of the
    /// output resumes it.
    pub fn record_success(&mut self, task_id: TaskId) -> RetryState {
        let mut state = self
            .states
            .remove(&task_id)
            .unwrap_or_else(|| RetryState::new(task_id));
        state.attempt_count += 1;
        self.settled.insert(task_id, state.clone());
        state
    }

    /// Drop retry and success tallies of tasks whose phase is over.
    /// Escalations stay until resolved.
    pub fn forget(&mut self, task_ids: impl IntoIterator<Item = TaskId>) {
        for task_id in task_ids {
            self.states.remove(&task_id);
            self.settled.remove(&task_id);
        }
    }

    pub fn state(&self, task_id: &TaskId) -> Option<&RetryState> {
        self.states.get(task_id)
    }

    /// Failed attempts recorded so far for a task that is still retrying.
    pub fn attempts(&self, task_id: &TaskId) -> u32 {
        self.states.get(task_id).map_or(0, |s| s.attempt_count)
    }

    pub fn is_escalated(&self, task_id: &TaskId) -> bool {
        self.escalated.contains(task_id)
    }

    /// Tasks awaiting manual resolution.
    pub fn escalated(&self) -> Vec<TaskId> {
        self.escalated.iter().copied().collect()
    }

    /// Mark an escalated task as resolved by hand. Returns false if it was
    /// not escalated.
    pub fn resolve(&mut self, task_id: &TaskId) -> bool {
        self.escalated.remove(task_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
