//! End-to-end workflow tests.
//!
//! These tests run workflows from start to completion and check the phase
//! sequence, the recorded history and the context handed between roles.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use conductor::config::{PhasePlan, TaskPlan};
use conductor::context::WORKFLOW_KEY;
use conductor::core::{Priority, Role, TaskOutput};
use conductor::orchestration::{RunOutcome, ATTEMPTS_KEY};
use conductor::validation::ValidationGate;
use conductor::workflow::{
    AdvanceOutcome, Phase, PhaseState, TransitionOutcome, WorkflowStateMachine, WorkflowStatus,
};

use crate::fixtures::{
    fast_config, good, in_memory, registry, reliable_registry, ScriptedExecutor,
};

/// Test: Accepted phase moves the workflow forward
/// Given a workflow over [analysis, architecture]
/// When the analysis output passes validation
/// Then the workflow is in architecture with one accepted transition
#[test]
fn test_accepted_phase_advances() {
    let mut machine = WorkflowStateMachine::new(Arc::new(ValidationGate::with_default_rules()));
    let id = machine
        .start(vec![Phase::Analysis, Phase::Architecture])
        .unwrap();

    let output = TaskOutput::new(
        conductor::core::TaskId::new(),
        Role::ProductAnalyst,
        good("analysis"),
    );
    let outcome = machine.advance(id, &[output]).unwrap();

    assert_eq!(outcome, AdvanceOutcome::Accepted(PhaseState::Active(Phase::Architecture)));
    assert_eq!(
        machine.current_phase(id).unwrap(),
        PhaseState::Active(Phase::Architecture)
    );
    let history = machine.history(id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, Phase::Analysis);
    assert_eq!(history[0].outcome, TransitionOutcome::Accepted);
}

/// Test: Default sequence runs to completion
/// Given reliable executors for every role
/// When a workflow over the default phases is run
/// Then it completes with one accepted transition and one entry per phase
#[tokio::test]
async fn test_default_sequence_completes() {
    let orch = in_memory(fast_config(&Phase::DEFAULT_SEQUENCE), reliable_registry());

    let (id, outcome) = orch.run_workflow(None).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let status = orch.status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.state, PhaseState::Completed);
    assert_eq!(status.completed_phases, Phase::DEFAULT_SEQUENCE.to_vec());
    assert_eq!(status.rollback_count, 0);

    let history = orch.history(id).await.unwrap();
    assert_eq!(history.len(), Phase::DEFAULT_SEQUENCE.len());
    assert!(history
        .iter()
        .all(|t| t.outcome == TransitionOutcome::Accepted));
    assert_eq!(history.last().unwrap().to, PhaseState::Completed);

    let context = orch.context().read().await;
    let entries = context.for_workflow(id);
    assert_eq!(entries.len(), Phase::DEFAULT_SEQUENCE.len());
    for entry in &entries {
        assert_eq!(entry.metadata[WORKFLOW_KEY], json!(id.to_string()));
        assert_eq!(entry.metadata[ATTEMPTS_KEY], json!(1));
    }
}

/// Test: Later roles see earlier work
/// Given analysis, architecture and implementation phases
/// When the workflow runs
/// Then each task receives the entries of the roles before it, dependencies first
#[tokio::test]
async fn test_context_handed_between_roles() {
    let analyst = ScriptedExecutor::reliable("analyst");
    let architect = ScriptedExecutor::reliable("architect");
    let developer = ScriptedExecutor::reliable("developer");
    let phases = [Phase::Analysis, Phase::Architecture, Phase::Implementation];
    let orch = in_memory(
        fast_config(&phases),
        registry(vec![
            (Role::ProductAnalyst, analyst.clone()),
            (Role::Architect, architect.clone()),
            (Role::Developer, developer.clone()),
        ]),
    );

    let (id, outcome) = orch.run_workflow(None).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let context = orch.context().read().await;
    let entries = context.for_workflow(id);
    let analysis = entries[0].id;
    let architecture = entries[1].id;

    assert!(analyst.calls()[0].context.is_empty());
    assert_eq!(architect.calls()[0].context, vec![analysis]);
    assert_eq!(developer.calls()[0].context, vec![analysis, architecture]);

    // The architecture entry was derived from the analysis entry.
    assert!(entries[1].depends_on(analysis));
}

/// Test: Context does not leak across workflows
/// Given two workflows run one after the other on the same store
/// When the second workflow's architect runs
/// Then it only sees the second workflow's analysis
#[tokio::test]
async fn test_context_isolated_per_workflow() {
    let architect = ScriptedExecutor::reliable("architect");
    let phases = [Phase::Analysis, Phase::Architecture];
    let orch = in_memory(
        fast_config(&phases),
        registry(vec![
            (Role::ProductAnalyst, ScriptedExecutor::reliable("analyst")),
            (Role::Architect, architect.clone()),
        ]),
    );

    orch.run_workflow(None).await.unwrap();
    let (second, _) = orch.run_workflow(None).await.unwrap();

    let context = orch.context().read().await;
    assert_eq!(context.len(), 4);
    let second_analysis = context.for_workflow(second)[0].id;
    assert_eq!(architect.calls()[1].context, vec![second_analysis]);
}

/// Test: Phase plan with sibling dependencies
/// Given an implementation plan where a reviewer waits for two developers
/// When the phase runs
/// Then the developers run first and the reviewer's entry depends on both
#[tokio::test]
async fn test_phase_plan_sibling_dependencies() {
    let developer = ScriptedExecutor::reliable("developer");
    let reviewer = ScriptedExecutor::reliable("reviewer");

    let mut config = fast_config(&[Phase::Implementation]);
    let plan = PhasePlan {
        tasks: vec![
            TaskPlan {
                role: Role::Developer,
                description: Some("Build the API".to_string()),
                priority: Priority::High,
                after: vec![],
            },
            TaskPlan {
                role: Role::Developer,
                description: Some("Build the client".to_string()),
                priority: Priority::Medium,
                after: vec![],
            },
            TaskPlan {
                role: Role::CodeReviewer,
                description: Some("Review both".to_string()),
                priority: Priority::Medium,
                after: vec![0, 1],
            },
        ],
    };
    config.phase_plans = BTreeMap::from([(Phase::Implementation.as_str().to_string(), plan)]);

    let orch = in_memory(
        config,
        registry(vec![
            (Role::Developer, developer.clone()),
            (Role::CodeReviewer, reviewer.clone()),
        ]),
    );

    let (id, outcome) = orch.run_workflow(None).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(developer.call_count(), 2);
    assert_eq!(reviewer.call_count(), 1);

    let context = orch.context().read().await;
    let entries = context.for_workflow(id);
    assert_eq!(entries.len(), 3);

    let review = entries
        .iter()
        .find(|e| e.role == Role::CodeReviewer)
        .unwrap();
    let built: Vec<_> = entries
        .iter()
        .filter(|e| e.role == Role::Developer)
        .map(|e| e.id)
        .collect();
    assert_eq!(built.len(), 2);
    for dev in &built {
        assert!(review.depends_on(*dev));
    }

    let mut seen = reviewer.calls()[0].context.clone();
    seen.sort();
    let mut expected = built.clone();
    expected.sort();
    assert_eq!(seen, expected);
}

/// Test: Task descriptions follow the phase
/// Given the default plan
/// When the review phase runs
/// Then the reviewer receives "Execute review phase"
#[tokio::test]
async fn test_default_task_description() {
    let reviewer = ScriptedExecutor::reliable("reviewer");
    let orch = in_memory(
        fast_config(&[Phase::Review]),
        registry(vec![(Role::CodeReviewer, reviewer.clone())]),
    );

    orch.run_workflow(None).await.unwrap();
    let call = &reviewer.calls()[0];
    assert_eq!(call.task.description, "Execute review phase");
    assert_eq!(call.task.phase, Phase::Review);
    assert!(!call.task.is_retry());
}

/// Test: Explicit phase list overrides the configuration
/// Given a config with the default sequence
/// When a workflow is started with only [review]
/// Then only the reviewer is called
#[tokio::test]
async fn test_explicit_phase_list() {
    let reviewer = ScriptedExecutor::reliable("reviewer");
    let analyst = ScriptedExecutor::reliable("analyst");
    let orch = in_memory(
        fast_config(&Phase::DEFAULT_SEQUENCE),
        registry(vec![
            (Role::CodeReviewer, reviewer.clone()),
            (Role::ProductAnalyst, analyst.clone()),
        ]),
    );

    let (id, outcome) = orch.run_workflow(Some(vec![Phase::Review])).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(reviewer.call_count(), 1);
    assert_eq!(analyst.call_count(), 0);
    assert_eq!(orch.history(id).await.unwrap().len(), 1);
}

/// Test: Starting with an empty phase list fails
#[tokio::test]
async fn test_empty_phase_list_rejected() {
    let orch = in_memory(fast_config(&[Phase::Review]), reliable_registry());
    let err = orch.start(Some(vec![])).await.unwrap_err();
    assert!(matches!(err, conductor::Error::Config(_)));
}
