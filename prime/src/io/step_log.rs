//! Per-task step logs under `<data_dir>/tasks/<id>/`.
//!
//! Every phase of a task (prompt, reply, command, output, ...) is written as
//! its own markdown artifact, `<seq:04>_<yyyymmddHHMMSS>_<phase>.md`, and
//! indexed in `index.jsonl`. These logs are the audit trail: they hold the
//! text before prompt elision. Execution output is bounded by the capture
//! limit, and cut streams carry a `[stdout truncated N bytes]` notice.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{LogPhase, TaskId};

/// One indexed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u32,
    pub phase: LogPhase,
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub bytes: usize,
}

#[derive(Debug)]
pub struct StepLog {
    root: PathBuf,
    // Serializes seq allocation when a cancel races the worker.
    write_lock: Mutex<()>,
}

impl StepLog {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn index_path(&self, id: TaskId) -> PathBuf {
        self.task_dir(id).join("index.jsonl")
    }

    pub fn write(
        &self,
        id: TaskId,
        phase: LogPhase,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<LogEntry> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("step log lock poisoned"))?;
        let dir = self.task_dir(id);
        fs::create_dir_all(&dir).with_context(|| format!("create log dir {}", dir.display()))?;

        let seq = self.entries(id)?.last().map_or(1, |entry| entry.seq + 1);
        let filename = format!(
            "{seq:04}_{}_{}.md",
            now.format("%Y%m%d%H%M%S"),
            phase.as_str()
        );
        let contents = render_artifact(id, phase, body, now);
        let path = dir.join(&filename);
        fs::write(&path, &contents).with_context(|| format!("write {}", path.display()))?;

        let entry = LogEntry {
            seq,
            phase,
            filename,
            timestamp: now,
            bytes: contents.len(),
        };
        let mut line = serde_json::to_string(&entry).context("serialize log entry")?;
        line.push('\n');
        let index = self.index_path(id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .with_context(|| format!("open {}", index.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", index.display()))?;
        debug!(task_id = %id, seq, phase = phase.as_str(), "step log written");
        Ok(entry)
    }

    /// Indexed artifacts in write order. Missing task dir yields an empty list.
    pub fn entries(&self, id: TaskId) -> Result<Vec<LogEntry>> {
        let index = self.index_path(id);
        if !index.exists() {
            return Ok(Vec::new());
        }
        let contents =
            fs::read_to_string(&index).with_context(|| format!("read {}", index.display()))?;
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(err = %err, "skipping corrupt index line");
                    None
                }
            })
            .collect())
    }

    /// Read one artifact. Only names present in the index are served.
    pub fn read(&self, id: TaskId, filename: &str) -> Result<Option<String>> {
        if filename.contains('/') || filename.contains('\\') || filename.starts_with('.') {
            bail!("invalid log file name {filename:?}");
        }
        if !self.entries(id)?.iter().any(|entry| entry.filename == filename) {
            return Ok(None);
        }
        let path = self.task_dir(id).join(filename);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(Some(contents))
    }
}

fn render_artifact(id: TaskId, phase: LogPhase, body: &str, now: DateTime<Utc>) -> String {
    let mut buf = format!(
        "# {}\n\n- task: {id}\n- time: {}\n\n",
        phase.title(),
        now.to_rfc3339()
    );
    buf.push_str(body);
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf
}
