//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted executors with per-call behaviour
//! - Fast configurations and orchestrator construction
//! - Temporary data directories

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use conductor::config::Config;
use conductor::context::{ContextEntry, EntryId};
use conductor::core::{Role, Task};
use conductor::orchestration::{
    Executor, ExecutorBindings, ExecutorError, ExecutorRegistry, Orchestrator,
};
use conductor::validation::ValidationGate;
use conductor::workflow::Phase;

/// What a scripted executor does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer with this payload.
    Reply(Value),
    /// Report a task failure.
    Fail(String),
    /// Report a transport failure.
    Down(String),
    /// Wait, then answer.
    Slow(Duration, Value),
}

/// A payload that passes every built-in rule.
pub fn good(label: &str) -> Value {
    json!({ "content": format!("{}: a complete deliverable with enough detail to review", label) })
}

/// A payload rejected by `non_empty_content`.
pub fn blank() -> Value {
    json!("   ")
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub task: Task,
    pub context: Vec<EntryId>,
}

/// Executor that plays back a script, repeating the last step forever.
pub struct ScriptedExecutor {
    label: String,
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Step>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(label: &str, steps: Vec<Step>) -> Arc<Self> {
        let last = steps
            .last()
            .cloned()
            .unwrap_or_else(|| Step::Reply(good(label)));
        Arc::new(Self {
            label: label.to_string(),
            script: Mutex::new(steps.into()),
            last: Mutex::new(last),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Always answers with a passing payload.
    pub fn reliable(label: &str) -> Arc<Self> {
        Self::new(label, vec![Step::Reply(good(label))])
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of simultaneous invocations observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(step) => {
                *self.last.lock().unwrap() = step.clone();
                step
            }
            None => self.last.lock().unwrap().clone(),
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.label
    }

    async fn invoke(
        &self,
        task: &Task,
        context: &[Arc<ContextEntry>],
    ) -> Result<Value, ExecutorError> {
        self.calls.lock().unwrap().push(Call {
            task: task.clone(),
            context: context.iter().map(|e| e.id).collect(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let step = self.next_step();
        let result = match step {
            Step::Reply(value) => Ok(value),
            Step::Fail(message) => Err(ExecutorError::Task(message)),
            Step::Down(message) => Err(ExecutorError::Transport(message)),
            Step::Slow(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Defaults with millisecond backoff so transport retries stay fast.
pub fn fast_config(phases: &[Phase]) -> Config {
    Config {
        phases: phases.to_vec(),
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..Config::default()
    }
}

pub fn registry(bindings: Vec<(Role, Arc<ScriptedExecutor>)>) -> Arc<ExecutorRegistry> {
    let bindings: ExecutorBindings = bindings
        .into_iter()
        .map(|(role, exec)| (role, exec as Arc<dyn Executor>))
        .collect();
    Arc::new(ExecutorRegistry::new(bindings))
}

/// Every default role bound to its own reliable executor.
pub fn reliable_registry() -> Arc<ExecutorRegistry> {
    registry(
        Role::ALL
            .into_iter()
            .map(|role| (role, ScriptedExecutor::reliable(role.as_str())))
            .collect(),
    )
}

pub fn in_memory(config: Config, registry: Arc<ExecutorRegistry>) -> Orchestrator {
    Orchestrator::new(config, registry, ValidationGate::with_default_rules())
        .expect("valid test config")
}

pub fn with_gate(
    config: Config,
    registry: Arc<ExecutorRegistry>,
    gate: ValidationGate,
) -> Orchestrator {
    Orchestrator::new(config, registry, gate).expect("valid test config")
}

pub fn persistent(config: Config, registry: Arc<ExecutorRegistry>, dir: &Path) -> Orchestrator {
    Orchestrator::persistent(config, registry, ValidationGate::with_default_rules(), dir)
        .expect("open persistent orchestrator")
}

pub fn data_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}
