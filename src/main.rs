use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use conductor::config::Config;
use conductor::orchestration::{
    CommandExecutor, ExecutorRegistry, Orchestrator, OrchestratorEvent, RunOutcome,
};
use conductor::state::WorkflowStore;
use conductor::util::blocking;
use conductor::validation::ValidationGate;
use conductor::workflow::{Phase, WorkflowId, WorkflowInstance, WorkflowStatus};
use conductor::{clog, clog_debug, Error, Result};

/// Conductor - phase-gated workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)\n    CONDUCTOR_LOG=LEVEL   Log threshold: error, warn, info, debug or trace"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Configuration file (defaults to ~/.conductor/conductor.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Start a workflow and drive it to an outcome
    Start {
        /// Phases to run, in order (defaults to the configured sequence)
        #[arg(long = "phase", value_name = "PHASE")]
        phases: Vec<Phase>,
    },

    /// Continue a persisted workflow from its current phase
    Resume {
        /// Workflow ID or unique prefix
        workflow_id: String,
    },

    /// Abandon a workflow
    Abort {
        /// Workflow ID or unique prefix
        workflow_id: String,
    },

    /// Show one workflow
    Status {
        /// Workflow ID or unique prefix
        workflow_id: String,
    },

    /// List persisted workflows
    List {
        /// Only workflows that can still be resumed
        #[arg(long)]
        active: bool,
    },

    /// Show a workflow's phase transitions and decisions
    History {
        /// Workflow ID or unique prefix
        workflow_id: String,
    },

    /// List shared context entries
    Context {
        /// Only entries written by this workflow
        workflow_id: Option<String>,
    },

    /// Delete every shared context entry
    ClearContext,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    if let Command::Init { force } = cli.command {
        return run_init(&config_path, force);
    }

    let config = Config::load_from(&config_path)?;
    let data_dir = config.ensure_dirs()?;
    conductor::log::init(&data_dir, cli.debug);
    if cli.debug {
        if let Some(path) = conductor::log::path() {
            eprintln!("Logging to {}", path.display());
        }
    }
    clog!("Conductor starting: {:?}", cli.command);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(dispatch(cli.command, config, data_dir))
}

async fn dispatch(command: Command, config: Config, data_dir: PathBuf) -> Result<()> {
    let store = WorkflowStore::new(&data_dir);

    match command {
        Command::Init { .. } => Ok(()),
        Command::Start { phases } => {
            let phases = if phases.is_empty() { None } else { Some(phases) };
            let (tx, printer) = spawn_printer();
            let orchestrator = build(config, &data_dir).await?.with_events(tx);

            let id = orchestrator.start(phases).await?;
            println!("Workflow {}", id);
            let outcome = orchestrator.run(id).await;
            drop(orchestrator);
            let _ = printer.await;
            report(id, outcome?)
        }
        Command::Resume { workflow_id } => {
            let id = parse_workflow_id(&workflow_id, &store)?;
            let (tx, printer) = spawn_printer();
            let orchestrator = build(config, &data_dir).await?.with_events(tx);

            let outcome = orchestrator.resume(id).await;
            drop(orchestrator);
            let _ = printer.await;
            report(id, outcome?)
        }
        Command::Abort { workflow_id } => {
            let id = parse_workflow_id(&workflow_id, &store)?;
            build(config, &data_dir).await?.abort(id).await?;
            println!("Workflow {} aborted", id.short());
            Ok(())
        }
        Command::Status { workflow_id } => {
            let id = parse_workflow_id(&workflow_id, &store)?;
            let instance = store.load(id)?;
            print_instance(&instance);
            Ok(())
        }
        Command::List { active } => {
            let workflows = blocking(move || {
                if active {
                    store.list_live()
                } else {
                    store.list()
                }
            })
            .await?;
            if workflows.is_empty() {
                println!("No workflows");
            }
            for instance in workflows {
                println!("{}", instance.summary());
            }
            Ok(())
        }
        Command::History { workflow_id } => {
            let id = parse_workflow_id(&workflow_id, &store)?;
            let instance = store.load(id)?;
            print_instance(&instance);
            println!();
            println!("Transitions:");
            for t in &instance.history {
                println!(
                    "  {}  {} -> {} ({})",
                    t.at.format("%Y-%m-%d %H:%M:%S"),
                    t.from,
                    t.to,
                    t.outcome
                );
            }
            println!("Decisions:");
            for d in &instance.decisions {
                let task = d.task.map(|t| format!(" task={}", t.short())).unwrap_or_default();
                println!(
                    "  {}  {}{}: {}",
                    d.at.format("%Y-%m-%d %H:%M:%S"),
                    d.kind,
                    task,
                    d.rationale
                );
            }
            Ok(())
        }
        Command::Context { workflow_id } => {
            let filter = workflow_id
                .map(|id| parse_workflow_id(&id, &store))
                .transpose()?;
            let orchestrator = build(config, &data_dir).await?;
            let context = orchestrator.context().read().await;
            let entries: Vec<_> = match filter {
                Some(id) => context.for_workflow(id),
                None => context.history().cloned().collect(),
            };
            for entry in entries {
                println!(
                    "{}  {:<16} deps={} {}",
                    entry.id,
                    entry.role.as_str(),
                    entry.dependencies.len(),
                    truncate_string(&entry.payload.to_string(), 60)
                );
            }
            Ok(())
        }
        Command::ClearContext => {
            build(config, &data_dir).await?.clear_context().await?;
            println!("Context cleared");
            Ok(())
        }
    }
}

fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    Config::default().save_to(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// A persistent orchestrator with one command executor per configured role.
async fn build(config: Config, data_dir: &Path) -> Result<Orchestrator> {
    let registry = Arc::new(ExecutorRegistry::empty());
    for (role, command) in config.executor_commands()? {
        registry
            .bind(role, Arc::new(CommandExecutor::new(&command)?))
            .await;
    }
    clog_debug!("Executors bound for {:?}", registry.roles().await);
    Orchestrator::persistent(config, registry, ValidationGate::with_default_rules(), data_dir)
}

fn spawn_printer() -> (
    mpsc::Sender<OrchestratorEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });
    (tx, handle)
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::PhaseStarted { phase, tasks, .. } => {
            println!("==> {} ({} task(s))", phase, tasks)
        }
        OrchestratorEvent::TaskDispatched { task, attempt, .. } => {
            println!("    dispatch {} attempt {}", task.short(), attempt)
        }
        OrchestratorEvent::TaskStored { task, attempts, .. } => {
            println!("    stored   {} after {} attempt(s)", task.short(), attempts)
        }
        OrchestratorEvent::TaskRetried { task, reason, .. } => {
            println!("    retry    {}: {}", task.short(), reason)
        }
        OrchestratorEvent::TaskEscalated { task, attempts, .. } => {
            println!("    ESCALATED {} after {} attempt(s)", task.short(), attempts)
        }
        OrchestratorEvent::PhaseAdvanced { from, to, .. } => println!("    {} -> {}", from, to),
        OrchestratorEvent::RolledBack { from, to, .. } => {
            println!("<== rolled back {} -> {}", from, to)
        }
        OrchestratorEvent::WorkflowCompleted { .. } => println!("Workflow completed"),
        OrchestratorEvent::WorkflowAbandoned { reason, .. } => {
            println!("Workflow abandoned: {}", reason)
        }
    }
}

fn report(id: WorkflowId, outcome: RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Completed => {
            println!("Workflow {} completed", id.short());
            Ok(())
        }
        RunOutcome::Escalated { phase, tasks } => {
            println!(
                "Workflow {} halted in {}: {} task(s) need manual resolution",
                id.short(),
                phase,
                tasks.len()
            );
            for state in &tasks {
                println!("  {}:", state.task_id.short());
                for failure in &state.failures {
                    println!("    - {}", failure);
                }
            }
            println!("Resume with: conductor resume {}", id.short());
            match tasks.first() {
                Some(state) => Err(Error::Escalate {
                    task: state.task_id,
                    attempts: state.attempt_count,
                }),
                None => Ok(()),
            }
        }
        RunOutcome::Abandoned { reason } => {
            println!("Workflow {} abandoned: {}", id.short(), reason);
            Ok(())
        }
        RunOutcome::Aborted => {
            println!("Workflow {} aborted", id.short());
            Ok(())
        }
    }
}

fn print_instance(instance: &WorkflowInstance) {
    let completed: Vec<&str> = instance
        .completed_phases()
        .iter()
        .map(|p| p.as_str())
        .collect();
    println!("  ID:          {}", instance.id);
    println!("  Status:      {}", format_status(instance.status));
    println!("  Phase:       {}", instance.state);
    let failed: Vec<&str> = instance.failed_phases().iter().map(|p| p.as_str()).collect();
    println!("  Completed:   [{}]", completed.join(", "));
    if !failed.is_empty() {
        println!("  Failed:      [{}]", failed.join(", "));
    }
    println!("  Rollbacks:   {}", instance.rollback_count());
    println!(
        "  Created:     {}",
        instance.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Updated:     {}",
        instance.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}

/// Format workflow status with color codes for terminal.
fn format_status(status: WorkflowStatus) -> String {
    match status {
        WorkflowStatus::Completed => format!("\x1b[32m{}\x1b[0m", status),
        WorkflowStatus::Abandoned => format!("\x1b[31m{}\x1b[0m", status),
        WorkflowStatus::Running => format!("\x1b[33m{}\x1b[0m", status),
        WorkflowStatus::RolledBack => format!("\x1b[35m{}\x1b[0m", status),
        WorkflowStatus::Pending => format!("\x1b[90m{}\x1b[0m", status),
    }
}

/// Parse a workflow ID from string, supporting both full UUIDs and short prefixes.
fn parse_workflow_id(id: &str, store: &WorkflowStore) -> Result<WorkflowId> {
    if let Ok(wf_id) = id.parse::<WorkflowId>() {
        return Ok(wf_id);
    }

    let workflows = store.list()?;
    let matches: Vec<_> = workflows
        .iter()
        .filter(|w| w.id.to_string().starts_with(id))
        .collect();

    match matches.len() {
        0 => Err(Error::Config(format!("No workflow matching '{}'", id))),
        1 => Ok(matches[0].id),
        _ => Err(Error::Config(format!(
            "Ambiguous workflow ID '{}' matches {} workflows",
            id,
            matches.len()
        ))),
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
