//! Executor capability and the role binding registry.
//!
//! Every role is served by something implementing [`Executor`]. The
//! orchestrator never looks at which implementation it calls; it captures
//! the registry's current binding set when it dispatches a wave of tasks, so
//! a [`ExecutorRegistry::reload`] only affects later dispatches.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::context::ContextEntry;
use crate::core::{Role, Task};
use crate::clog;

/// Why an executor produced no output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// The backend could not be reached or did not answer in time.
    /// Retried by the orchestrator with backoff.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The backend ran the task and reported a failure.
    #[error("task failure: {0}")]
    Task(String),
}

/// Runs one task with its context and returns an opaque payload.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str {
        "executor"
    }

    async fn invoke(
        &self,
        task: &Task,
        context: &[Arc<ContextEntry>],
    ) -> std::result::Result<serde_json::Value, ExecutorError>;
}

pub type ExecutorBindings = HashMap<Role, Arc<dyn Executor>>;

/// Role -> executor bindings, swappable at runtime.
pub struct ExecutorRegistry {
    active: RwLock<Arc<ExecutorBindings>>,
}

impl ExecutorRegistry {
    pub fn new(bindings: ExecutorBindings) -> Self {
        Self {
            active: RwLock::new(Arc::new(bindings)),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    /// Replace the whole binding set in one step.
    pub async fn reload(&self, bindings: ExecutorBindings) {
        let roles = bindings.len();
        *self.active.write().await = Arc::new(bindings);
        clog!("Executor bindings reloaded: {} role(s)", roles);
    }

    /// Bind or rebind one role, keeping the others.
    pub async fn bind(&self, role: Role, executor: Arc<dyn Executor>) {
        let mut active = self.active.write().await;
        let mut bindings = ExecutorBindings::clone(&active);
        bindings.insert(role, executor);
        *active = Arc::new(bindings);
    }

    /// The binding set in force right now.
    pub async fn snapshot(&self) -> Arc<ExecutorBindings> {
        Arc::clone(&*self.active.read().await)
    }

    pub async fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.active.read().await.keys().copied().collect();
        roles.sort();
        roles
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
