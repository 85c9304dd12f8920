//! Durable task rows and the append-only history under `<data_dir>/state/`.
//!
//! Layout:
//! - `state/tasks/<id>.json`: one row per task, replaced atomically.
//! - `state/history.jsonl`: one line per finished task.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{Task, TaskId, TaskStatus};
use crate::io::config::write_atomic;

/// One finished task as recorded in `history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: TaskId,
    pub goal: String,
    pub status: TaskStatus,
    pub output: String,
    pub duration: u64,
    pub ts: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_task(task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            id: task.id,
            goal: task.goal.clone(),
            status: task.status,
            output: task.output.clone(),
            duration: task.duration.unwrap_or_else(|| task.elapsed_secs(now)),
            ts: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks_dir: PathBuf,
    history_path: PathBuf,
}

impl TaskStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            tasks_dir: state_dir.join("tasks"),
            history_path: state_dir.join("history.jsonl"),
        }
    }

    fn row_path(&self, id: TaskId) -> PathBuf {
        self.tasks_dir.join(format!("{id}.json"))
    }

    pub fn save(&self, task: &Task) -> Result<()> {
        let path = self.row_path(task.id);
        debug!(task_id = %task.id, status = %task.status, "writing task row");
        let mut buf = serde_json::to_string_pretty(task).context("serialize task row")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    pub fn load(&self, id: TaskId) -> Result<Option<Task>> {
        let path = self.row_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read task row {}", path.display()))?;
        let task = serde_json::from_str(&contents)
            .with_context(|| format!("parse task row {}", path.display()))?;
        Ok(Some(task))
    }

    /// Ids of every persisted row, ascending.
    pub fn ids(&self) -> Result<Vec<TaskId>> {
        if !self.tasks_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.tasks_dir)
            .with_context(|| format!("read {}", self.tasks_dir.display()))?
        {
            let entry = entry.context("read task dir entry")?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match stem.parse::<TaskId>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(file = %entry.path().display(), "ignoring unexpected file in task dir"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn max_id(&self) -> Result<Option<TaskId>> {
        Ok(self.ids()?.last().copied())
    }

    pub fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.history_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(entry).context("serialize history entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .with_context(|| format!("open {}", self.history_path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.history_path.display()))?;
        Ok(())
    }

    /// Most recent `limit` history entries, newest first. Corrupt lines are skipped.
    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.history_path)
            .with_context(|| format!("read {}", self.history_path.display()))?;
        let mut entries: Vec<HistoryEntry> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(err = %err, "skipping corrupt history line");
                    None
                }
            })
            .collect();
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}
