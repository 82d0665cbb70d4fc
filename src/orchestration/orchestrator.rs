//! The orchestrator drives workflows phase by phase.
//!
//! For each phase it builds the phase's tasks from the configured plan,
//! dispatches them to executors in dependency waves (bounded by a shared
//! semaphore), validates each output before writing it to the context
//! store, and then asks the state machine to advance.
//!
//! ## Recovery
//!
//! - Transport failures (executor timeout, unreachable backend) are retried
//!   here with exponential backoff. Exhausting them counts as one failed
//!   attempt of the task.
//! - A task whose output fails validation goes to the [`RetryController`]:
//!   it is re-dispatched with its failure notes until the controller
//!   escalates it. An escalated task stops the run with the workflow left
//!   in its current phase; nothing from its dispatch wave is stored.
//! - A phase rejection whose errors all name tasks sends those tasks back
//!   through the controller and re-runs them in place.
//! - A phase whose outputs are rejected as a set, or whose blamed tasks
//!   escalate, is rolled back to the previous phase (or re-run when it is
//!   the first). Once the rollback budget is spent the workflow is
//!   abandoned.
//!
//! Running a workflow again resolves the escalations recorded for it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::context::{ContextEntry, ContextLog, ContextStore, EntryId, PHASE_KEY, TASK_KEY, WORKFLOW_KEY};
use crate::core::{Metadata, Task, TaskDAG, TaskId, TaskOutput};
use crate::error::{Error, Result};
use crate::orchestration::executor::{Executor, ExecutorBindings, ExecutorError, ExecutorRegistry};
use crate::orchestration::retry::{RetryController, RetryDecision, RetryState};
use crate::state::WorkflowStore;
use crate::util::{backoff_delay, with_deadline};
use crate::validation::{ValidationError, ValidationGate, ValidationResult};
use crate::workflow::{
    AdvanceOutcome, Decision, DecisionKind, Phase, PhaseState, PhaseTransition, WorkflowId,
    WorkflowStateMachine, WorkflowSummary,
};
use crate::{clog, clog_debug, clog_warn};

/// Metadata key for the number of attempts a stored output took.
pub const ATTEMPTS_KEY: &str = "attempts";

/// Progress notifications from the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    PhaseStarted {
        workflow: WorkflowId,
        phase: Phase,
        tasks: usize,
    },
    TaskDispatched {
        workflow: WorkflowId,
        task: TaskId,
        attempt: u32,
    },
    TaskStored {
        workflow: WorkflowId,
        task: TaskId,
        entry: EntryId,
        attempts: u32,
    },
    TaskRetried {
        workflow: WorkflowId,
        task: TaskId,
        attempt: u32,
        reason: String,
    },
    TaskEscalated {
        workflow: WorkflowId,
        task: TaskId,
        attempts: u32,
    },
    PhaseAdvanced {
        workflow: WorkflowId,
        from: Phase,
        to: PhaseState,
    },
    RolledBack {
        workflow: WorkflowId,
        from: Phase,
        to: Phase,
    },
    WorkflowCompleted {
        workflow: WorkflowId,
    },
    WorkflowAbandoned {
        workflow: WorkflowId,
        reason: String,
    },
}

/// How a call to [`Orchestrator::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// Tasks exhausted their retries; the workflow stays in `phase` until
    /// someone resolves them and resumes it.
    Escalated {
        phase: Phase,
        tasks: Vec<RetryState>,
    },
    Abandoned {
        reason: String,
    },
    Aborted,
}

/// Outcome of running one phase's tasks.
enum PhaseRun {
    /// Every task's output, stored, in dispatch order.
    Collected(Vec<(Task, TaskOutput)>),
    Escalated(Vec<RetryState>),
    Aborted,
}

/// Outcome of running one task to a verdict.
enum TaskRun {
    /// Passed validation; not stored yet.
    Validated(TaskOutput),
    Escalated(RetryState),
    Aborted,
}

/// Outcome of re-running the tasks a phase rejection blamed.
enum InPlace {
    Retried,
    /// A blamed task escalated or could not be found; roll back instead.
    Exhausted,
    Aborted,
}

enum AfterFailure {
    Retry(Task),
    Escalated(RetryState),
}

pub struct Orchestrator {
    config: Config,
    registry: Arc<ExecutorRegistry>,
    gate: Arc<ValidationGate>,
    context: Arc<RwLock<ContextStore>>,
    machine: Arc<Mutex<WorkflowStateMachine>>,
    retries: Arc<Mutex<RetryController>>,
    semaphore: Arc<Semaphore>,
    cancels: Mutex<HashMap<WorkflowId, CancellationToken>>,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl Orchestrator {
    /// An orchestrator that keeps everything in memory.
    ///
    /// # Errors
    /// Returns `Error::Config` if the configuration does not validate.
    pub fn new(config: Config, registry: Arc<ExecutorRegistry>, gate: ValidationGate) -> Result<Self> {
        config.validate()?;
        let gate = Arc::new(gate);
        let machine = WorkflowStateMachine::new(Arc::clone(&gate))
            .with_rollback_limit(config.max_rollbacks, config.rollback_policy);
        Ok(Self::assemble(config, registry, gate, ContextStore::new(), machine))
    }

    /// An orchestrator persisting workflows and context under `data_dir`.
    ///
    /// The context store is rebuilt from its log, so earlier workflows can be
    /// resumed.
    pub fn persistent(
        config: Config,
        registry: Arc<ExecutorRegistry>,
        gate: ValidationGate,
        data_dir: &Path,
    ) -> Result<Self> {
        config.validate()?;
        let gate = Arc::new(gate);
        let machine = WorkflowStateMachine::new(Arc::clone(&gate))
            .with_rollback_limit(config.max_rollbacks, config.rollback_policy)
            .with_store(WorkflowStore::new(data_dir));
        let context = ContextStore::open(ContextLog::in_dir(data_dir))?;
        clog_debug!(
            "Orchestrator::persistent data_dir={} entries={}",
            data_dir.display(),
            context.len()
        );
        Ok(Self::assemble(config, registry, gate, context, machine))
    }

    fn assemble(
        config: Config,
        registry: Arc<ExecutorRegistry>,
        gate: Arc<ValidationGate>,
        context: ContextStore,
        machine: WorkflowStateMachine,
    ) -> Self {
        let retries = RetryController::with_max_attempts(config.max_task_attempts);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_executors));
        Self {
            config,
            registry,
            gate,
            context: Arc::new(RwLock::new(context)),
            machine: Arc::new(Mutex::new(machine)),
            retries: Arc::new(Mutex::new(retries)),
            semaphore,
            cancels: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Send progress events to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<RwLock<ContextStore>> {
        &self.context
    }

    /// Create a workflow over `phases`, or the configured phases.
    pub async fn start(&self, phases: Option<Vec<Phase>>) -> Result<WorkflowId> {
        let phases = phases.unwrap_or_else(|| self.config.phases.clone());
        let id = self.machine.lock().await.start(phases)?;
        self.cancels.lock().await.insert(id, CancellationToken::new());
        Ok(id)
    }

    /// Create a workflow and drive it to an outcome.
    pub async fn run_workflow(&self, phases: Option<Vec<Phase>>) -> Result<(WorkflowId, RunOutcome)> {
        let id = self.start(phases).await?;
        let outcome = self.run(id).await?;
        Ok((id, outcome))
    }

    /// Drive a started workflow until it completes, escalates, is abandoned
    /// or is aborted.
    pub async fn run(&self, id: WorkflowId) -> Result<RunOutcome> {
        let token = self.token(id).await;
        self.release_escalations(id).await?;
        self.context.write().await.attach_workflow(id);

        let outcome = self.drive(id, &token).await;

        self.context.write().await.detach_workflow(id);
        if let Ok(RunOutcome::Completed | RunOutcome::Abandoned { .. } | RunOutcome::Aborted) =
            &outcome
        {
            self.cancels.lock().await.remove(&id);
            self.release_escalations(id).await?;
        }
        outcome
    }

    /// Bring a persisted workflow into memory. A no-op for known workflows.
    pub async fn load(&self, id: WorkflowId) -> Result<PhaseState> {
        self.machine.lock().await.load(id)
    }

    /// Reload a persisted workflow and continue from its current phase.
    pub async fn resume(&self, id: WorkflowId) -> Result<RunOutcome> {
        let state = self.load(id).await?;
        if state.is_terminal() {
            return Err(Error::InvalidTransition {
                workflow: id,
                from: state.to_string(),
                to: "resumed".to_string(),
            });
        }
        clog!("Resuming workflow {} at {}", id.short(), state);
        self.run(id).await
    }

    /// Stop a workflow between dispatches.
    ///
    /// The abort is recorded and the workflow abandoned immediately; outputs
    /// of invocations still in flight are discarded.
    pub async fn abort(&self, id: WorkflowId) -> Result<()> {
        let mut machine = self.machine.lock().await;
        machine.load(id)?;
        self.token(id).await.cancel();
        machine.abort(id, "aborted by caller")?;
        drop(machine);
        clog_warn!("Workflow {} aborted", id.short());
        Ok(())
    }

    pub async fn current_phase(&self, id: WorkflowId) -> Result<PhaseState> {
        self.machine.lock().await.current_phase(id)
    }

    pub async fn status(&self, id: WorkflowId) -> Result<WorkflowSummary> {
        self.machine.lock().await.status(id)
    }

    pub async fn history(&self, id: WorkflowId) -> Result<Vec<PhaseTransition>> {
        Ok(self.machine.lock().await.history(id)?.to_vec())
    }

    pub async fn decisions(&self, id: WorkflowId) -> Result<Vec<Decision>> {
        Ok(self.machine.lock().await.decisions(id)?.to_vec())
    }

    /// Tasks escalated for manual resolution.
    pub async fn escalated_tasks(&self) -> Vec<TaskId> {
        self.retries.lock().await.escalated()
    }

    /// Wipe the context store. Refused while any workflow is running.
    pub async fn clear_context(&self) -> Result<()> {
        self.context.write().await.clear()
    }

    /// Clear the escalations recorded for a workflow from the retry
    /// controller.
    async fn release_escalations(&self, id: WorkflowId) -> Result<()> {
        let tasks: Vec<TaskId> = self
            .machine
            .lock()
            .await
            .decisions(id)?
            .iter()
            .filter(|d| d.kind == DecisionKind::Escalate)
            .filter_map(|d| d.task)
            .collect();

        let mut retries = self.retries.lock().await;
        for task in &tasks {
            if retries.resolve(task) {
                clog_debug!("Escalation of task {} released", task.short());
            }
        }
        Ok(())
    }

    async fn token(&self, id: WorkflowId) -> CancellationToken {
        self.cancels
            .lock()
            .await
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    async fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    async fn drive(&self, id: WorkflowId, token: &CancellationToken) -> Result<RunOutcome> {
        self.machine.lock().await.mark_running(id)?;

        'phases: loop {
            let (state, aborted) = {
                let mut machine = self.machine.lock().await;
                let state = machine.refresh(id)?;
                (state, machine.instance(id)?.was_aborted())
            };
            let phase = match state {
                PhaseState::Active(phase) => phase,
                PhaseState::Completed => {
                    self.emit(OrchestratorEvent::WorkflowCompleted { workflow: id }).await;
                    return Ok(RunOutcome::Completed);
                }
                PhaseState::Abandoned if aborted || token.is_cancelled() => {
                    return Ok(RunOutcome::Aborted)
                }
                PhaseState::Abandoned => {
                    return Ok(RunOutcome::Abandoned {
                        reason: "workflow already abandoned".to_string(),
                    })
                }
            };
            if token.is_cancelled() {
                return Ok(RunOutcome::Aborted);
            }

            let mut collected = match self.run_phase(id, phase, token).await? {
                PhaseRun::Collected(collected) => collected,
                PhaseRun::Escalated(tasks) => {
                    clog_warn!(
                        "Workflow {} halted in {}: {} task(s) escalated",
                        id.short(),
                        phase,
                        tasks.len()
                    );
                    return Ok(RunOutcome::Escalated { phase, tasks });
                }
                PhaseRun::Aborted => return Ok(RunOutcome::Aborted),
            };

            let rejected = loop {
                let outputs: Vec<TaskOutput> =
                    collected.iter().map(|(_, output)| output.clone()).collect();
                let mut machine = self.machine.lock().await;
                if token.is_cancelled() {
                    return Ok(RunOutcome::Aborted);
                }
                let result = match machine.advance(id, &outputs) {
                    Ok(AdvanceOutcome::Accepted(next)) => {
                        drop(machine);
                        self.retries
                            .lock()
                            .await
                            .forget(collected.iter().map(|(task, _)| task.id));
                        self.emit(OrchestratorEvent::PhaseAdvanced {
                            workflow: id,
                            from: phase,
                            to: next,
                        })
                        .await;
                        continue 'phases;
                    }
                    Ok(AdvanceOutcome::Rejected(result)) => result,
                    // Aborted from another process since the phase began.
                    Err(Error::InvalidTransition { .. })
                        if machine.instance(id)?.was_aborted() =>
                    {
                        clog_warn!("Workflow {} was aborted elsewhere", id.short());
                        return Ok(RunOutcome::Aborted);
                    }
                    Err(e) => return Err(e),
                };
                drop(machine);

                // Errors pinned on tasks go through the retry controller first.
                let Some(blamed) = result.blamed_tasks() else {
                    break result;
                };
                match self
                    .retry_in_place(id, &mut collected, &blamed, &result, token)
                    .await?
                {
                    InPlace::Retried => continue,
                    InPlace::Exhausted => break result,
                    InPlace::Aborted => return Ok(RunOutcome::Aborted),
                }
            };
            self.retries
                .lock()
                .await
                .forget(collected.iter().map(|(task, _)| task.id));

            // The set is at fault: go back one phase and rebuild from there.
            let mut machine = self.machine.lock().await;
            let phases = &machine.instance(id)?.phases;
            let target = phases
                .iter()
                .position(|p| *p == phase)
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| phases.get(i).copied())
                .unwrap_or(phase);

            match machine.rollback(id, target) {
                Ok(_) => {
                    drop(machine);
                    clog!(
                        "Workflow {} rolled back {} -> {}: {}",
                        id.short(),
                        phase,
                        target,
                        rejected.summary()
                    );
                    self.emit(OrchestratorEvent::RolledBack {
                        workflow: id,
                        from: phase,
                        to: target,
                    })
                    .await;
                }
                Err(Error::RollbackExhausted { max, .. }) => {
                    drop(machine);
                    let reason = format!(
                        "rollback limit of {} exhausted in {}: {}",
                        max,
                        phase,
                        rejected.summary()
                    );
                    self.emit(OrchestratorEvent::WorkflowAbandoned {
                        workflow: id,
                        reason: reason.clone(),
                    })
                    .await;
                    return Ok(RunOutcome::Abandoned { reason });
                }
                Err(Error::InvalidTransition { .. }) if machine.instance(id)?.was_aborted() => {
                    return Ok(RunOutcome::Aborted);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_phase(
        &self,
        id: WorkflowId,
        phase: Phase,
        token: &CancellationToken,
    ) -> Result<PhaseRun> {
        let tasks = self.config.plan_for(phase).tasks_for(phase)?;
        let dag = TaskDAG::from_tasks(tasks)?;
        self.emit(OrchestratorEvent::PhaseStarted {
            workflow: id,
            phase,
            tasks: dag.task_count(),
        })
        .await;

        let mut settled: HashSet<TaskId> = HashSet::new();
        let mut produced: HashMap<TaskId, EntryId> = HashMap::new();
        let mut collected = Vec::with_capacity(dag.task_count());

        while !dag.all_settled(&settled) {
            let wave: Vec<Task> = dag.ready_tasks(&settled).into_iter().cloned().collect();
            if wave.is_empty() {
                break;
            }

            // Bindings are captured per wave; a reload applies to later waves.
            let bindings = self.registry.snapshot().await;
            let mut prepared = Vec::with_capacity(wave.len());
            for task in wave {
                let siblings: Vec<EntryId> = task
                    .after
                    .iter()
                    .filter_map(|sibling| produced.get(sibling).copied())
                    .collect();
                let task = self.with_required_context(id, task, &siblings).await?;
                prepared.push(task);
            }
            clog_debug!(
                "Workflow {} phase {} dispatching wave of {}",
                id.short(),
                phase,
                prepared.len()
            );

            let runs = join_all(
                prepared
                    .iter()
                    .map(|task| self.run_task(id, task, &bindings, token)),
            )
            .await;

            let mut validated = Vec::with_capacity(prepared.len());
            let mut escalated = Vec::new();
            let mut aborted = false;
            for (task, run) in prepared.into_iter().zip(runs) {
                settled.insert(task.id);
                match run? {
                    TaskRun::Validated(output) => validated.push((task, output)),
                    TaskRun::Escalated(state) => escalated.push(state),
                    TaskRun::Aborted => aborted = true,
                }
            }

            // A wave is stored whole or not at all.
            let entries = if aborted || !escalated.is_empty() {
                None
            } else {
                self.store_wave(id, &validated, token).await?
            };
            let Some(entries) = entries else {
                self.retries.lock().await.forget(settled.iter().copied());
                if escalated.is_empty() {
                    return Ok(PhaseRun::Aborted);
                }
                return Ok(PhaseRun::Escalated(escalated));
            };
            for ((task, output), entry) in validated.into_iter().zip(entries) {
                produced.insert(task.id, entry);
                collected.push((task, output));
            }
        }

        Ok(PhaseRun::Collected(collected))
    }

    /// Re-dispatch the tasks a phase rejection points at, keeping the other
    /// outputs of the phase.
    async fn retry_in_place(
        &self,
        id: WorkflowId,
        collected: &mut [(Task, TaskOutput)],
        blamed: &[TaskId],
        rejected: &ValidationResult,
        token: &CancellationToken,
    ) -> Result<InPlace> {
        let mut retries = Vec::with_capacity(blamed.len());
        let mut exhausted = false;
        for task_id in blamed {
            let Some(index) = collected.iter().position(|(task, _)| task.id == *task_id) else {
                clog_warn!("Phase rejection names unknown task {}", task_id.short());
                return Ok(InPlace::Exhausted);
            };
            let failure = rejected.summary_for(*task_id);
            match self.after_failure(id, &collected[index].0, failure).await? {
                AfterFailure::Retry(task) => retries.push((index, task)),
                AfterFailure::Escalated(_) => exhausted = true,
            }
        }
        if exhausted {
            return Ok(InPlace::Exhausted);
        }

        let bindings = self.registry.snapshot().await;
        let runs = join_all(
            retries
                .iter()
                .map(|(_, task)| self.run_task(id, task, &bindings, token)),
        )
        .await;

        let mut indices = Vec::with_capacity(retries.len());
        let mut validated = Vec::with_capacity(retries.len());
        for ((index, task), run) in retries.into_iter().zip(runs) {
            match run? {
                TaskRun::Validated(output) => {
                    indices.push(index);
                    validated.push((task, output));
                }
                TaskRun::Escalated(_) => exhausted = true,
                TaskRun::Aborted => return Ok(InPlace::Aborted),
            }
        }
        if exhausted {
            return Ok(InPlace::Exhausted);
        }

        if self.store_wave(id, &validated, token).await?.is_none() {
            return Ok(InPlace::Aborted);
        }
        for (index, replacement) in indices.into_iter().zip(validated) {
            collected[index] = replacement;
        }
        Ok(InPlace::Retried)
    }

    /// Attach the context a task must see: the latest work of other roles in
    /// the workflow plus the outputs of the siblings it waited for.
    async fn with_required_context(
        &self,
        id: WorkflowId,
        task: Task,
        siblings: &[EntryId],
    ) -> Result<Task> {
        let store = self.context.read().await;
        let mut seeds: Vec<EntryId> = store
            .get_for_role(task.role, id)
            .iter()
            .map(|entry| entry.id)
            .collect();
        seeds.extend_from_slice(siblings);

        let mut seen = HashSet::new();
        seeds.retain(|id| seen.insert(*id));
        for id in &seeds {
            if !store.contains(id) {
                return Err(Error::UnknownDependency { dependency: *id });
            }
        }
        Ok(task.with_context(seeds))
    }

    async fn run_task(
        &self,
        id: WorkflowId,
        task: &Task,
        bindings: &ExecutorBindings,
        token: &CancellationToken,
    ) -> Result<TaskRun> {
        let executor = bindings
            .get(&task.role)
            .cloned()
            .ok_or(Error::UnknownRole(task.role))?;
        let mut current = task.clone();

        loop {
            if token.is_cancelled() {
                return Ok(TaskRun::Aborted);
            }

            let context = self.context.read().await.resolve(&current.required_context)?;
            let attempt = self.retries.lock().await.attempts(&task.id) + 1;
            self.emit(OrchestratorEvent::TaskDispatched {
                workflow: id,
                task: task.id,
                attempt,
            })
            .await;

            let failure = match self.invoke(executor.as_ref(), &current, &context, token).await {
                Ok(payload) => {
                    let output = TaskOutput::new(task.id, task.role, payload);
                    let verdict = self.gate.evaluate_task(task.phase, &output);
                    if verdict.passed {
                        return Ok(TaskRun::Validated(output));
                    }
                    verdict.summary()
                }
                Err(Error::ValidationFailed { errors }) => errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
                Err(e @ Error::ExecutorUnavailable { .. }) => e.to_string(),
                Err(e) => return Err(e),
            };

            if token.is_cancelled() {
                return Ok(TaskRun::Aborted);
            }

            match self.after_failure(id, task, failure).await? {
                AfterFailure::Retry(retry) => current = retry,
                AfterFailure::Escalated(state) => return Ok(TaskRun::Escalated(state)),
            }
        }
    }

    /// Feed a failed attempt to the retry controller and record its verdict.
    async fn after_failure(&self, id: WorkflowId, task: &Task, failure: String) -> Result<AfterFailure> {
        let decision = self.retries.lock().await.record_failure(task.id, &failure)?;
        match decision {
            RetryDecision::Retry {
                attempt,
                failure_notes,
            } => {
                clog_warn!(
                    "Task {} attempt {} failed, retrying: {}",
                    task.id.short(),
                    attempt,
                    failure
                );
                self.machine.lock().await.record_task_decision(
                    id,
                    DecisionKind::Retry,
                    task.id,
                    &format!("attempt {} failed: {}", attempt, failure),
                )?;
                self.emit(OrchestratorEvent::TaskRetried {
                    workflow: id,
                    task: task.id,
                    attempt,
                    reason: failure,
                })
                .await;
                Ok(AfterFailure::Retry(task.retry_with(&failure_notes)))
            }
            RetryDecision::Escalate(state) => {
                clog_warn!(
                    "Task {} escalated after {} attempts",
                    task.id.short(),
                    state.attempt_count
                );
                self.machine.lock().await.record_task_decision(
                    id,
                    DecisionKind::Escalate,
                    task.id,
                    &format!(
                        "{} attempts failed, manual resolution required: {}",
                        state.attempt_count,
                        state.failures.join(" | ")
                    ),
                )?;
                self.emit(OrchestratorEvent::TaskEscalated {
                    workflow: id,
                    task: task.id,
                    attempts: state.attempt_count,
                })
                .await;
                Ok(AfterFailure::Escalated(state))
            }
        }
    }

    /// Write a wave of validated outputs unless the workflow was aborted
    /// meanwhile. Returns the new entries in wave order, or `None` when the
    /// outputs were discarded.
    async fn store_wave(
        &self,
        id: WorkflowId,
        wave: &[(Task, TaskOutput)],
        token: &CancellationToken,
    ) -> Result<Option<Vec<EntryId>>> {
        // Holding the state machine lock orders the writes against `abort`.
        let mut machine = self.machine.lock().await;
        if token.is_cancelled() || machine.refresh(id)?.is_terminal() {
            clog_debug!(
                "Discarding {} output(s) of workflow {} after abort",
                wave.len(),
                id.short()
            );
            return Ok(None);
        }

        let mut stored = Vec::with_capacity(wave.len());
        {
            let mut retries = self.retries.lock().await;
            let mut context = self.context.write().await;
            for (task, output) in wave {
                let final_state = retries.record_success(task.id);
                let mut metadata: Metadata = task.metadata.clone();
                metadata.insert(WORKFLOW_KEY.to_string(), id.to_string().into());
                metadata.insert(TASK_KEY.to_string(), task.id.to_string().into());
                metadata.insert(PHASE_KEY.to_string(), task.phase.as_str().into());
                metadata.insert(ATTEMPTS_KEY.to_string(), final_state.attempt_count.into());

                let entry = context.store(
                    task.role,
                    output.payload.clone(),
                    metadata,
                    task.required_context.clone(),
                )?;
                stored.push((task.id, entry, final_state.attempt_count));
            }
        }
        drop(machine);

        for &(task, entry, attempts) in &stored {
            self.emit(OrchestratorEvent::TaskStored {
                workflow: id,
                task,
                entry,
                attempts,
            })
            .await;
        }
        Ok(Some(stored.into_iter().map(|(_, entry, _)| entry).collect()))
    }

    /// One executor call with transport retries, backoff and a deadline.
    ///
    /// # Errors
    /// `ExecutorUnavailable` once transport attempts are spent,
    /// `ValidationFailed` when the executor reports a task failure.
    async fn invoke(
        &self,
        executor: &dyn Executor,
        task: &Task,
        context: &[Arc<ContextEntry>],
        token: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let attempts = self.config.transport_attempts;
        let deadline = self.config.executor_timeout();
        let mut reason = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(
                    attempt - 1,
                    self.config.backoff_base(),
                    self.config.backoff_max(),
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => break,
                }
            }

            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|e| Error::TaskJoin(e.to_string()))?;

            match with_deadline(deadline, executor.invoke(task, context)).await {
                Ok(Ok(payload)) => return Ok(payload),
                Ok(Err(ExecutorError::Task(message))) => {
                    return Err(Error::ValidationFailed {
                        errors: vec![ValidationError::new(executor.name(), &message)],
                    });
                }
                Ok(Err(ExecutorError::Transport(message))) => reason = message,
                Err(e) => reason = e.to_string(),
            }
            clog_warn!(
                "Executor {} transport failure for task {} ({}/{}): {}",
                executor.name(),
                task.id.short(),
                attempt + 1,
                attempts,
                reason
            );
        }

        Err(Error::ExecutorUnavailable {
            task: task.id,
            attempts,
            reason,
        })
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("phases", &self.config.phases)
            .field("max_concurrent", &self.config.max_concurrent_executors)
            .field("events", &self.events.is_some())
            .finish()
    }
}
