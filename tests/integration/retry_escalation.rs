//! Retry and escalation integration tests.
//!
//! These tests verify that tasks failing validation are retried with their
//! failure notes, that success after retries is recorded with the right
//! attempt count, and that a task failing every attempt is escalated
//! exactly once without writing to the context store.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use conductor::config::{PhasePlan, TaskPlan};
use conductor::core::{Priority, Role};
use conductor::orchestration::{Executor, OrchestratorEvent, RunOutcome, ATTEMPTS_KEY};
use conductor::workflow::{DecisionKind, Phase, PhaseState, WorkflowStatus};

use crate::fixtures::{
    blank, fast_config, good, in_memory, registry, ScriptedExecutor, Step,
};

/// Test: Success on the third attempt
/// Given an implementation task that fails validation twice
/// When the third attempt passes
/// Then the entry is stored with attempts=3 and nothing is escalated
#[tokio::test]
async fn test_success_after_two_validation_failures() {
    let developer = ScriptedExecutor::new(
        "developer",
        vec![
            Step::Reply(blank()),
            Step::Reply(blank()),
            Step::Reply(good("implementation")),
        ],
    );
    let (tx, mut rx) = mpsc::channel(64);
    let orch = in_memory(
        fast_config(&[Phase::Implementation]),
        registry(vec![(Role::Developer, developer.clone())]),
    )
    .with_events(tx);

    let (id, outcome) = orch.run_workflow(None).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(developer.call_count(), 3);

    let context = orch.context().read().await;
    let entries = context.for_workflow(id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].metadata[ATTEMPTS_KEY], serde_json::json!(3));
    drop(context);

    let decisions = orch.decisions(id).await.unwrap();
    assert_eq!(
        decisions
            .iter()
            .filter(|d| d.kind == DecisionKind::Retry)
            .count(),
        2
    );
    assert!(decisions.iter().all(|d| d.kind != DecisionKind::Escalate));
    assert!(orch.escalated_tasks().await.is_empty());

    drop(orch);
    let mut stored_attempts = None;
    let mut escalations = 0;
    while let Some(event) = rx.recv().await {
        match event {
            OrchestratorEvent::TaskStored { attempts, .. } => stored_attempts = Some(attempts),
            OrchestratorEvent::TaskEscalated { .. } => escalations += 1,
            _ => {}
        }
    }
    assert_eq!(stored_attempts, Some(3));
    assert_eq!(escalations, 0);
}

/// Test: Retries carry the failure notes
/// Given a task that fails validation once
/// When it is dispatched again
/// Then the second dispatch is the same task with one failure note
#[tokio::test]
async fn test_retry_carries_failure_notes() {
    let developer = ScriptedExecutor::new(
        "developer",
        vec![Step::Reply(blank()), Step::Reply(good("implementation"))],
    );
    let orch = in_memory(
        fast_config(&[Phase::Implementation]),
        registry(vec![(Role::Developer, developer.clone())]),
    );

    orch.run_workflow(None).await.unwrap();

    let calls = developer.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].task.id, calls[1].task.id);
    assert!(!calls[0].task.is_retry());
    assert!(calls[1].task.is_retry());
    assert_eq!(calls[1].task.failure_notes.len(), 1);
    assert!(calls[1].task.failure_notes[0].contains("EMPTY_OUTPUT"));
}

/// Test: Escalation after three failed attempts
/// Given an implementation task whose output never passes validation
/// When the workflow runs
/// Then escalation is signaled once, no entry is stored for the task and the
/// workflow stays in implementation
#[tokio::test]
async fn test_escalation_after_three_failures() {
    let developer = ScriptedExecutor::new("developer", vec![Step::Reply(blank())]);
    let (tx, mut rx) = mpsc::channel(64);
    let orch = in_memory(
        fast_config(&[Phase::Architecture, Phase::Implementation]),
        registry(vec![
            (Role::Architect, ScriptedExecutor::reliable("architect")),
            (Role::Developer, developer.clone()),
        ]),
    )
    .with_events(tx);

    let (id, outcome) = orch.run_workflow(None).await.unwrap();

    let tasks = match outcome {
        RunOutcome::Escalated { phase, tasks } => {
            assert_eq!(phase, Phase::Implementation);
            tasks
        }
        other => panic!("expected escalation, got {:?}", other),
    };
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempt_count, 3);
    assert_eq!(tasks[0].failures.len(), 3);
    assert_eq!(developer.call_count(), 3);

    // Only the architecture entry exists.
    let context = orch.context().read().await;
    let entries = context.for_workflow(id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].role, Role::Architect);
    drop(context);

    assert_eq!(
        orch.current_phase(id).await.unwrap(),
        PhaseState::Active(Phase::Implementation)
    );
    let status = orch.status(id).await.unwrap();
    assert_ne!(status.status, WorkflowStatus::Abandoned);
    assert_eq!(orch.escalated_tasks().await, vec![tasks[0].task_id]);

    let decisions = orch.decisions(id).await.unwrap();
    let escalations: Vec<_> = decisions
        .iter()
        .filter(|d| d.kind == DecisionKind::Escalate)
        .collect();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].task, Some(tasks[0].task_id));
    assert_eq!(escalations[0].phase, Some(Phase::Implementation));

    drop(orch);
    let mut escalated_events = 0;
    while let Some(event) = rx.recv().await {
        if matches!(event, OrchestratorEvent::TaskEscalated { attempts: 3, .. }) {
            escalated_events += 1;
        }
    }
    assert_eq!(escalated_events, 1);
}

/// Test: Executor task failures count as failed attempts
/// Given an executor that reports a task failure once
/// When the workflow runs
/// Then the failure is retried and recorded with the executor's message
#[tokio::test]
async fn test_executor_task_failure_is_retried() {
    let developer = ScriptedExecutor::new(
        "developer",
        vec![
            Step::Fail("compilation failed".to_string()),
            Step::Reply(good("implementation")),
        ],
    );
    let orch = in_memory(
        fast_config(&[Phase::Implementation]),
        registry(vec![(Role::Developer, developer.clone())]),
    );

    let (id, outcome) = orch.run_workflow(None).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let decisions = orch.decisions(id).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].kind, DecisionKind::Retry);
    assert!(decisions[0].rationale.contains("compilation failed"));
}

/// Test: Transport failures are folded into one failed attempt
/// Given an executor that is always unreachable and two transport attempts
/// When the workflow runs
/// Then every validation attempt makes two calls before escalation
#[tokio::test]
async fn test_unreachable_executor_escalates() {
    let developer =
        ScriptedExecutor::new("developer", vec![Step::Down("connection refused".to_string())]);
    let mut config = fast_config(&[Phase::Implementation]);
    config.transport_attempts = 2;
    let orch = in_memory(config, registry(vec![(Role::Developer, developer.clone())]));

    let (id, outcome) = orch.run_workflow(None).await.unwrap();
    match outcome {
        RunOutcome::Escalated { tasks, .. } => {
            assert_eq!(tasks[0].attempt_count, 3);
            assert!(tasks[0]
                .failures
                .iter()
                .all(|f| f.contains("connection refused")));
        }
        other => panic!("expected escalation, got {:?}", other),
    }
    assert_eq!(developer.call_count(), 6);
    assert!(orch.context().read().await.for_workflow(id).is_empty());
}

/// Test: Configured attempt limit
/// Given max_task_attempts = 1
/// When the first attempt fails
/// Then the task is escalated immediately
#[tokio::test]
async fn test_single_attempt_limit() {
    let developer = ScriptedExecutor::new("developer", vec![Step::Reply(blank())]);
    let mut config = fast_config(&[Phase::Implementation]);
    config.max_task_attempts = 1;
    let orch = in_memory(config, registry(vec![(Role::Developer, developer.clone())]));

    let (_, outcome) = orch.run_workflow(None).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Escalated { .. }));
    assert_eq!(developer.call_count(), 1);
}

/// Test: Escalated workflow resumes after the executor is fixed
/// Given a workflow halted by an escalated implementation task
/// When the developer binding is replaced and the workflow is run again
/// Then it completes from implementation without re-running architecture
#[tokio::test]
async fn test_rerun_after_escalation() {
    let architect = ScriptedExecutor::reliable("architect");
    let broken = ScriptedExecutor::new("broken", vec![Step::Reply(blank())]);
    let orch = in_memory(
        fast_config(&[Phase::Architecture, Phase::Implementation]),
        registry(vec![
            (Role::Architect, architect.clone()),
            (Role::Developer, broken),
        ]),
    );

    let (id, outcome) = orch.run_workflow(None).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Escalated { .. }));

    let fixed = ScriptedExecutor::reliable("fixed");
    orch.registry()
        .bind(Role::Developer, fixed.clone() as Arc<dyn Executor>)
        .await;

    assert_eq!(orch.run(id).await.unwrap(), RunOutcome::Completed);
    assert_eq!(architect.call_count(), 1);
    assert_eq!(fixed.call_count(), 1);
    assert_eq!(fixed.calls()[0].context.len(), 1);
    assert!(orch.escalated_tasks().await.is_empty());
}

fn pair_plan() -> BTreeMap<String, PhasePlan> {
    let task = |role| TaskPlan {
        role,
        description: None,
        priority: Priority::Medium,
        after: vec![],
    };
    BTreeMap::from([(
        Phase::Implementation.as_str().to_string(),
        PhasePlan {
            tasks: vec![task(Role::Developer), task(Role::Debugger)],
        },
    )])
}

/// Test: An escalated task keeps its whole wave out of the context store
/// Given a developer and a debugger dispatched together, the debugger failing
/// every attempt
/// When the workflow runs, and runs again once the debugger is fixed
/// Then the first run stores nothing, the second stores exactly one entry per
/// task and the escalation is released
#[tokio::test]
async fn test_escalated_wave_stores_nothing() {
    let developer = ScriptedExecutor::reliable("developer");
    let mut config = fast_config(&[Phase::Implementation]);
    config.phase_plans = pair_plan();
    let orch = in_memory(
        config,
        registry(vec![
            (Role::Developer, developer.clone()),
            (
                Role::Debugger,
                ScriptedExecutor::new("debugger", vec![Step::Reply(blank())]),
            ),
        ]),
    );

    let (id, outcome) = orch.run_workflow(None).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Escalated { .. }));
    assert_eq!(developer.call_count(), 1);
    assert!(orch.context().read().await.for_workflow(id).is_empty());
    assert_eq!(orch.escalated_tasks().await.len(), 1);

    orch.registry()
        .bind(Role::Debugger, ScriptedExecutor::reliable("debugger") as Arc<dyn Executor>)
        .await;
    assert_eq!(orch.run(id).await.unwrap(), RunOutcome::Completed);
    assert_eq!(developer.call_count(), 2);

    let entries = orch.context().read().await.for_workflow(id);
    let mut roles: Vec<Role> = entries.iter().map(|e| e.role).collect();
    roles.sort();
    assert_eq!(roles, vec![Role::Developer, Role::Debugger]);
    assert!(orch.escalated_tasks().await.is_empty());
}
