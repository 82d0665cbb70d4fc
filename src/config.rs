use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{Priority, Role, Task, TaskDAG};
use crate::workflow::{Phase, RollbackPolicy, DEFAULT_MAX_ROLLBACKS};
use crate::{clog_debug, Error, Result};

pub const CONFIG_FILE: &str = "conductor.toml";

/// One task in a phase plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub role: Role,
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Positions of sibling tasks in the same plan that must finish first.
    #[serde(default)]
    pub after: Vec<usize>,
}

/// The tasks dispatched when a phase is entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PhasePlan {
    #[serde(default)]
    pub tasks: Vec<TaskPlan>,
}

impl PhasePlan {
    /// A single task for the phase's default role.
    pub fn default_for(phase: Phase) -> Self {
        Self {
            tasks: vec![TaskPlan {
                role: default_role(phase),
                description: None,
                priority: Priority::default(),
                after: Vec::new(),
            }],
        }
    }

    /// Fresh tasks for one entry into `phase`, with sibling waits wired up.
    pub fn tasks_for(&self, phase: Phase) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|plan| {
                let description = plan
                    .description
                    .clone()
                    .unwrap_or_else(|| default_description(phase));
                Task::new(plan.role, phase, &description).with_priority(plan.priority)
            })
            .collect();

        for (position, plan) in self.tasks.iter().enumerate() {
            for &sibling in &plan.after {
                if sibling == position || sibling >= tasks.len() {
                    return Err(Error::Config(format!(
                        "task {} of phase {} waits for invalid sibling {}",
                        position, phase, sibling
                    )));
                }
                let sibling_id = tasks[sibling].id;
                tasks[position] = tasks[position].clone().after(sibling_id);
            }
        }
        Ok(tasks)
    }
}

/// The role that works a phase when no plan overrides it.
pub fn default_role(phase: Phase) -> Role {
    match phase {
        Phase::Analysis => Role::ProductAnalyst,
        Phase::Architecture => Role::Architect,
        Phase::Implementation | Phase::Deployment => Role::Developer,
        Phase::Debugging => Role::Debugger,
        Phase::Review => Role::CodeReviewer,
        Phase::DataAnalysis | Phase::FeatureEngineering => Role::DataScientist,
        Phase::ModelDevelopment | Phase::ModelTraining => Role::MlEngineer,
        Phase::ModelEvaluation => Role::AiEngineer,
    }
}

pub fn default_description(phase: Phase) -> String {
    format!("Execute {} phase", phase)
}

/// Orchestrator configuration, read from `<data_dir>/conductor.toml`.
///
/// Every field has a default, so a missing or partial file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: Option<String>,
    pub phases: Vec<Phase>,
    pub max_rollbacks: u32,
    pub rollback_policy: RollbackPolicy,
    pub max_task_attempts: u32,
    pub transport_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub executor_timeout_secs: u64,
    pub max_concurrent_executors: usize,
    /// Phase name -> task plan override.
    pub phase_plans: BTreeMap<String, PhasePlan>,
    /// Role name -> shell command bound to that role.
    pub executors: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            phases: Phase::DEFAULT_SEQUENCE.to_vec(),
            max_rollbacks: DEFAULT_MAX_ROLLBACKS,
            rollback_policy: RollbackPolicy::default(),
            max_task_attempts: 3,
            transport_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            executor_timeout_secs: 600,
            max_concurrent_executors: 4,
            phase_plans: BTreeMap::new(),
            executors: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn default_data_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    /// The configured data directory, or `~/.conductor`.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::default_data_dir(),
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::default_data_dir()?.join(CONFIG_FILE))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: phases={} max_rollbacks={} policy={:?} executors={}",
            config.phases.len(),
            config.max_rollbacks,
            config.rollback_policy,
            config.executors.len()
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<PathBuf> {
        let data_dir = self.data_dir()?;
        if !data_dir.exists() {
            clog_debug!("Creating data directory: {}", data_dir.display());
            fs::create_dir_all(&data_dir)?;
        }
        Ok(data_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(Error::Config("phases must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(*phase) {
                return Err(Error::Config(format!("phase {} listed twice", phase)));
            }
        }
        if self.max_task_attempts == 0 {
            return Err(Error::Config("max_task_attempts must be at least 1".to_string()));
        }
        if self.transport_attempts == 0 {
            return Err(Error::Config("transport_attempts must be at least 1".to_string()));
        }
        if self.max_concurrent_executors == 0 {
            return Err(Error::Config(
                "max_concurrent_executors must be at least 1".to_string(),
            ));
        }
        if self.executor_timeout_secs == 0 {
            return Err(Error::Config("executor_timeout_secs must be at least 1".to_string()));
        }
        for (name, plan) in &self.phase_plans {
            let phase: Phase = name.parse().map_err(Error::Config)?;
            if plan.tasks.is_empty() {
                return Err(Error::Config(format!("phase plan {} has no tasks", phase)));
            }
            TaskDAG::from_tasks(plan.tasks_for(phase)?)?;
        }
        for name in self.executors.keys() {
            name.parse::<Role>().map_err(Error::Config)?;
        }
        Ok(())
    }

    /// The plan for a phase: the configured override or the default single task.
    pub fn plan_for(&self, phase: Phase) -> PhasePlan {
        self.phase_plans
            .get(phase.as_str())
            .cloned()
            .unwrap_or_else(|| PhasePlan::default_for(phase))
    }

    /// Role bindings with parsed role names.
    pub fn executor_commands(&self) -> Result<Vec<(Role, String)>> {
        self.executors
            .iter()
            .map(|(name, command)| {
                let role = name.parse::<Role>().map_err(Error::Config)?;
                Ok((role, command.clone()))
            })
            .collect()
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
