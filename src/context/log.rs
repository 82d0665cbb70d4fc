//! Append-only JSON-lines log backing the context store.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::context::ContextEntry;
use crate::{clog_debug, clog_warn, Result};

pub const CONTEXT_LOG_FILE: &str = "context.jsonl";

/// One line per written entry, in write order.
#[derive(Debug, Clone)]
pub struct ContextLog {
    path: PathBuf,
}

impl ContextLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log at the default location under a data directory.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(CONTEXT_LOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ContextEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read every entry back in write order.
    ///
    /// A malformed final line is a torn write from a crash: it is skipped and
    /// cut from the file so later appends start on a clean line. Malformed
    /// lines anywhere else are an error.
    pub fn load(&self) -> Result<Vec<ContextEntry>> {
        if !self.path.exists() {
            clog_debug!("Context log not found at {}", self.path.display());
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path)?;
        let lines: Vec<(usize, &str)> = contents
            .split_inclusive('\n')
            .scan(0usize, |offset, line| {
                let start = *offset;
                *offset += line.len();
                Some((start, line))
            })
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();
        let mut entries = Vec::with_capacity(lines.len());

        for (i, (start, line)) in lines.iter().enumerate() {
            match serde_json::from_str::<ContextEntry>(line.trim_end()) {
                Ok(entry) => entries.push(entry),
                Err(e) if i + 1 == lines.len() => {
                    clog_warn!("Dropping torn context log line {}: {}", i + 1, e);
                    self.repair(*start as u64)?;
                    return Ok(entries);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !contents.is_empty() && !contents.ends_with('\n') {
            OpenOptions::new().append(true).open(&self.path)?.write_all(b"\n")?;
        }

        clog_debug!("Context log loaded: {} entries", entries.len());
        Ok(entries)
    }

    /// Cut the file back to `len` bytes, the end of the last good line.
    fn repair(&self, len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn truncate(&self) -> Result<()> {
        if self.path.exists() {
            fs::write(&self.path, "")?;
        }
        Ok(())
    }
}
