//! WorkflowStore - durable JSON records of workflow instances.

use std::fs;
use std::path::{Path, PathBuf};

use crate::workflow::{WorkflowId, WorkflowInstance};
use crate::{clog_debug, clog_warn, Error, Result};

const WORKFLOWS_DIR: &str = "workflows";
const ARCHIVE_DIR: &str = "archive";

/// One JSON document per workflow under `<root>/workflows/`.
///
/// Live instances are rewritten after every transition through a temp file
/// and rename, keeping the previous version as `<id>.json.bak`. Terminal
/// instances move to `<root>/workflows/archive/`.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    live_dir: PathBuf,
    archive_dir: PathBuf,
}

impl WorkflowStore {
    pub fn new(root: &Path) -> Self {
        let live_dir = root.join(WORKFLOWS_DIR);
        let archive_dir = live_dir.join(ARCHIVE_DIR);
        Self {
            live_dir,
            archive_dir,
        }
    }

    pub fn live_path(&self, id: WorkflowId) -> PathBuf {
        self.live_dir.join(format!("{}.json", id))
    }

    pub fn archive_path(&self, id: WorkflowId) -> PathBuf {
        self.archive_dir.join(format!("{}.json", id))
    }

    pub fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        let path = self.live_path(instance.id);
        clog_debug!("WorkflowStore::save path={}", path.display());

        if !self.live_dir.exists() {
            fs::create_dir_all(&self.live_dir)?;
        }

        if path.exists() {
            let backup_path = path.with_extension("json.bak");
            fs::copy(&path, &backup_path)?;
        }

        let contents = serde_json::to_string_pretty(instance)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Load a workflow, live or archived.
    ///
    /// A live record that fails to parse falls back to its backup.
    pub fn load(&self, id: WorkflowId) -> Result<WorkflowInstance> {
        let path = self.live_path(id);
        if path.exists() {
            match read_instance(&path) {
                Ok(instance) => return Ok(instance),
                Err(e) => {
                    let backup_path = path.with_extension("json.bak");
                    if !backup_path.exists() {
                        return Err(e);
                    }
                    clog_warn!(
                        "Workflow record {} unreadable ({}), using backup",
                        path.display(),
                        e
                    );
                    return read_instance(&backup_path);
                }
            }
        }

        let archived = self.archive_path(id);
        if archived.exists() {
            return read_instance(&archived);
        }

        Err(Error::WorkflowNotFound(id))
    }

    /// The archived record of a workflow, if it has finished.
    pub fn archived(&self, id: WorkflowId) -> Result<Option<WorkflowInstance>> {
        let path = self.archive_path(id);
        if !path.exists() {
            return Ok(None);
        }
        read_instance(&path).map(Some)
    }

    /// Move a terminal workflow out of the live directory.
    pub fn archive(&self, instance: &WorkflowInstance) -> Result<()> {
        if !self.archive_dir.exists() {
            fs::create_dir_all(&self.archive_dir)?;
        }

        let target = self.archive_path(instance.id);
        let temp_path = target.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(instance)?)?;
        fs::rename(&temp_path, &target)?;

        let live = self.live_path(instance.id);
        for stale in [live.clone(), live.with_extension("json.bak")] {
            if stale.exists() {
                fs::remove_file(&stale)?;
            }
        }
        clog_debug!("Workflow {} archived to {}", instance.id.short(), target.display());
        Ok(())
    }

    /// Every readable workflow record, oldest first.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<WorkflowInstance>> {
        let mut instances = Vec::new();
        for dir in [&self.live_dir, &self.archive_dir] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_instance(&path) {
                    Ok(instance) => instances.push(instance),
                    Err(e) => clog_warn!("Skipping workflow record {}: {}", path.display(), e),
                }
            }
        }
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    /// Non-terminal workflows that can be resumed.
    pub fn list_live(&self) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| !i.is_terminal())
            .collect())
    }
}

fn read_instance(path: &Path) -> Result<WorkflowInstance> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
