//! Executor backed by an external command.
//!
//! The command receives the task and its resolved context as one JSON
//! document on stdin and answers on stdout. JSON output is taken as the
//! payload as-is; anything else becomes a string payload.
//!
//! A command that cannot be spawned is a transport failure and is retried.
//! A non-zero exit is a task failure and goes through validation retries.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::context::ContextEntry;
use crate::core::Task;
use crate::error::{Error, Result};
use crate::orchestration::executor::{Executor, ExecutorError};
use crate::clog_debug;

/// Document written to the command's stdin.
#[derive(Debug, Serialize)]
struct Request<'a> {
    task: &'a Task,
    context: Vec<&'a ContextEntry>,
}

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    label: String,
    binary: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Parse a command line such as `"review-bot --strict"`.
    ///
    /// The program is looked up on `PATH` unless it is a path.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorNotFound` if the command line is empty or the
    /// program cannot be found.
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::ExecutorNotFound(command.to_string()))?;
        let binary =
            which::which(program).map_err(|_| Error::ExecutorNotFound(program.to_string()))?;
        Ok(Self {
            label: program.to_string(),
            binary,
            args: parts.map(str::to_string).collect(),
        })
    }

    /// Use a specific binary without a `PATH` lookup.
    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        let label = binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| binary.display().to_string());
        Self {
            label,
            binary,
            args,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn request(task: &Task, context: &[Arc<ContextEntry>]) -> std::result::Result<Vec<u8>, ExecutorError> {
        let request = Request {
            task,
            context: context.iter().map(|entry| entry.as_ref()).collect(),
        };
        serde_json::to_vec(&request).map_err(|e| ExecutorError::Task(e.to_string()))
    }

    /// Interpret the command's stdout.
    pub fn parse_output(stdout: &str) -> serde_json::Value {
        let trimmed = stdout.trim();
        serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.label
    }

    async fn invoke(
        &self,
        task: &Task,
        context: &[Arc<ContextEntry>],
    ) -> std::result::Result<serde_json::Value, ExecutorError> {
        let input = Self::request(task, context)?;

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Transport(format!("{}: {}", self.label, e)))?;

        // Feed stdin while draining stdout.
        let stdin = child.stdin.take();
        let label = &self.label;
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that exits without reading its input is not an error.
                if let Err(e) = stdin.write_all(&input).await {
                    clog_debug!("{} closed stdin early: {}", label, e);
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| ExecutorError::Transport(format!("{}: {}", self.label, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} failed with exit code {}",
                    self.label,
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(ExecutorError::Task(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        clog_debug!(
            "{} answered task {} with {} bytes",
            self.label,
            task.id.short(),
            stdout.len()
        );
        Ok(Self::parse_output(&stdout))
    }
}
