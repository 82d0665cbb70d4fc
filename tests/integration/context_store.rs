//! Context store integration tests.
//!
//! These tests verify dependency checking on write, dependency-ordered reads
//! and the lifecycle rules around clearing the store.

use std::collections::HashSet;

use serde_json::json;

use conductor::context::{ContextLog, ContextStore, EntryId, WORKFLOW_KEY};
use conductor::core::{Metadata, Role};
use conductor::workflow::WorkflowId;
use conductor::Error;

use crate::fixtures::data_dir;

fn meta(workflow: WorkflowId) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(WORKFLOW_KEY.to_string(), json!(workflow.to_string()));
    metadata
}

/// Every entry appears after everything it depends on.
fn assert_dependency_order(store: &ContextStore, ids: &[EntryId]) {
    let mut seen = HashSet::new();
    for id in ids {
        let entry = store.get(id).unwrap();
        for dep in &entry.dependencies {
            assert!(
                seen.contains(dep),
                "entry {} returned before its dependency {}",
                id,
                dep
            );
        }
        seen.insert(*id);
    }
}

/// Test: Unknown dependency rejected
/// Given a store with one entry
/// When a write declares a dependency that does not exist
/// Then it fails with UnknownDependency and the store is unchanged
#[test]
fn test_unknown_dependency_rejected() {
    let wf = WorkflowId::new();
    let mut store = ContextStore::new();
    store
        .store(Role::ProductAnalyst, json!("requirements"), meta(wf), vec![])
        .unwrap();

    let missing = EntryId::new();
    let err = store
        .store(Role::Architect, json!("design"), meta(wf), vec![missing])
        .unwrap_err();

    assert!(matches!(err, Error::UnknownDependency { dependency } if dependency == missing));
    assert_eq!(store.len(), 1);
    assert_eq!(store.history().len(), 1);
}

/// Test: Rejected writes leave the log untouched
/// Given a persistent store
/// When a write is rejected
/// Then reopening the store shows only the accepted entries
#[test]
fn test_rejected_write_not_logged() {
    let dir = data_dir();
    let wf = WorkflowId::new();
    {
        let mut store = ContextStore::open(ContextLog::in_dir(dir.path())).unwrap();
        store
            .store(Role::ProductAnalyst, json!("requirements"), meta(wf), vec![])
            .unwrap();
        assert!(store
            .store(Role::Architect, json!("design"), meta(wf), vec![EntryId::new()])
            .is_err());
    }

    let reopened = ContextStore::open(ContextLog::in_dir(dir.path())).unwrap();
    assert_eq!(reopened.len(), 1);
}

/// Test: Role reads are dependency ordered
/// Given a generated graph of entries across roles
/// When each role reads its context
/// Then no entry is returned before an entry it depends on
#[test]
fn test_get_for_role_respects_dependencies() {
    let wf = WorkflowId::new();
    let mut store = ContextStore::new();
    let mut ids: Vec<EntryId> = Vec::new();

    // Deterministic pseudo-random wiring over earlier entries.
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    for i in 0..60 {
        let role = Role::ALL[i % Role::ALL.len()];
        let mut deps = Vec::new();
        for _ in 0..3 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            if !ids.is_empty() && seed % 3 != 0 {
                deps.push(ids[(seed as usize) % ids.len()]);
            }
        }
        let id = store
            .store(role, json!(format!("entry {}", i)), meta(wf), deps)
            .unwrap();
        ids.push(id);
    }

    for role in Role::ALL {
        let context = store.get_for_role(role, wf);
        // The reader's own entries only appear as dependencies of others.
        for entry in context.iter().filter(|e| e.role == role) {
            assert!(context.iter().any(|other| other.depends_on(entry.id)));
        }
        let ids: Vec<EntryId> = context.iter().map(|e| e.id).collect();
        assert_dependency_order(&store, &ids);

        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }
}

/// Test: Resolve returns the closure in dependency order
/// Given a chain a <- b <- c and an unrelated entry d
/// When c is resolved
/// Then a, b, c are returned in that order and d is not
#[test]
fn test_resolve_closure() {
    let wf = WorkflowId::new();
    let mut store = ContextStore::new();
    let a = store
        .store(Role::ProductAnalyst, json!("a"), meta(wf), vec![])
        .unwrap();
    let b = store
        .store(Role::Architect, json!("b"), meta(wf), vec![a])
        .unwrap();
    let _d = store
        .store(Role::Debugger, json!("d"), meta(wf), vec![])
        .unwrap();
    let c = store
        .store(Role::Developer, json!("c"), meta(wf), vec![b])
        .unwrap();

    let resolved: Vec<EntryId> = store.resolve(&[c]).unwrap().iter().map(|e| e.id).collect();
    assert_eq!(resolved, vec![a, b, c]);

    assert!(matches!(
        store.resolve(&[EntryId::new()]),
        Err(Error::UnknownDependency { .. })
    ));
}

/// Test: Only the latest entry per role seeds a read
/// Given two analyst entries in one workflow
/// When the architect reads context
/// Then only the newer analyst entry is returned
#[test]
fn test_latest_entry_per_role() {
    let wf = WorkflowId::new();
    let mut store = ContextStore::new();
    store
        .store(Role::ProductAnalyst, json!("draft"), meta(wf), vec![])
        .unwrap();
    let revised = store
        .store(Role::ProductAnalyst, json!("revised"), meta(wf), vec![])
        .unwrap();

    let context = store.get_for_role(Role::Architect, wf);
    assert_eq!(context.len(), 1);
    assert_eq!(context[0].id, revised);
    assert!(store.get_for_role(Role::ProductAnalyst, wf).is_empty());
}

/// Test: Clearing is refused while a workflow runs
/// Given an attached workflow
/// When the store is cleared
/// Then StoreInUse is returned until the workflow detaches
#[test]
fn test_clear_refused_while_attached() {
    let dir = data_dir();
    let wf = WorkflowId::new();
    let mut store = ContextStore::open(ContextLog::in_dir(dir.path())).unwrap();
    store
        .store(Role::ProductAnalyst, json!("requirements"), meta(wf), vec![])
        .unwrap();

    store.attach_workflow(wf);
    assert!(matches!(
        store.clear(),
        Err(Error::StoreInUse { workflows: 1 })
    ));
    assert_eq!(store.len(), 1);

    store.detach_workflow(wf);
    store.clear().unwrap();
    assert!(store.is_empty());

    let reopened = ContextStore::open(ContextLog::in_dir(dir.path())).unwrap();
    assert!(reopened.is_empty());
}

/// Test: History is lazy and restartable
/// Given three entries
/// When history is iterated twice from a cloned iterator
/// Then both passes yield the entries in insertion order
#[test]
fn test_history_iteration() {
    let wf = WorkflowId::new();
    let mut store = ContextStore::new();
    let ids: Vec<EntryId> = (0..3)
        .map(|i| {
            store
                .store(Role::Developer, json!(i), meta(wf), vec![])
                .unwrap()
        })
        .collect();

    let mut history = store.history();
    assert_eq!(history.next().map(|e| e.id), Some(ids[0]));
    let rest = history.clone();
    assert_eq!(history.len(), 2);
    assert_eq!(rest.map(|e| e.id).collect::<Vec<_>>(), ids[1..].to_vec());
    assert_eq!(history.map(|e| e.id).collect::<Vec<_>>(), ids[1..].to_vec());
}
