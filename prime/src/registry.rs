//! In-memory task index with write-through persistence.
//!
//! Every mutation goes through [`TaskRegistry::update`], which applies the
//! change to the cached row and writes the durable row before releasing the
//! lock, so readers never observe a state the store does not have.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::types::{FIRST_TASK_ID, Task, TaskId, TaskStatus};
use crate::io::process::CancelToken;
use crate::io::store::TaskStore;

struct TaskEntry {
    task: Task,
    cancel: CancelToken,
}

pub struct TaskRegistry {
    store: TaskStore,
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
    next_id: Mutex<TaskId>,
}

impl TaskRegistry {
    /// Open the registry, continuing the id sequence after the highest persisted id.
    pub fn open(store: TaskStore) -> Result<Self> {
        let next_id = store
            .max_id()?
            .map_or(TaskId(FIRST_TASK_ID), |max| max.next().max(TaskId(FIRST_TASK_ID)));
        debug!(next_id = %next_id, "task registry opened");
        Ok(Self {
            store,
            tasks: RwLock::new(HashMap::new()),
            next_id: Mutex::new(next_id),
        })
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Allocate an id and persist a fresh `starting` row.
    pub fn create(&self, goal: &str, now: DateTime<Utc>) -> Result<(Task, CancelToken)> {
        let id = {
            let mut next = self
                .next_id
                .lock()
                .map_err(|_| anyhow!("id allocator lock poisoned"))?;
            let id = *next;
            *next = id.next();
            id
        };
        let task = Task::new(id, goal, now);
        let cancel = CancelToken::new();
        let mut tasks = self
            .tasks
            .write()
            .map_err(|_| anyhow!("task index lock poisoned"))?;
        self.store.save(&task)?;
        tasks.insert(
            id,
            TaskEntry {
                task: task.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(task_id = %id, "task created");
        Ok((task, cancel))
    }

    /// Current view of a task: the cached row, or the durable row for tasks
    /// from earlier processes.
    pub fn get(&self, id: TaskId) -> Result<Option<Task>> {
        {
            let tasks = self
                .tasks
                .read()
                .map_err(|_| anyhow!("task index lock poisoned"))?;
            if let Some(entry) = tasks.get(&id) {
                return Ok(Some(entry.task.clone()));
            }
        }
        self.store.load(id)
    }

    /// Tasks created or touched by this process, ordered by id.
    pub fn list(&self) -> Result<Vec<Task>> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| anyhow!("task index lock poisoned"))?;
        let mut list: Vec<Task> = tasks.values().map(|entry| entry.task.clone()).collect();
        list.sort_by_key(|task| task.id);
        Ok(list)
    }

    /// Apply `change` to a live task and persist it.
    ///
    /// A task that already reached a terminal status is returned unchanged:
    /// callers detect a concurrent cancel by checking the returned status.
    pub fn update<F>(&self, id: TaskId, now: DateTime<Utc>, change: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self
            .tasks
            .write()
            .map_err(|_| anyhow!("task index lock poisoned"))?;
        let entry = tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} is not active in this process"))?;
        if entry.task.status.is_terminal() {
            return Ok(entry.task.clone());
        }
        let mut next = entry.task.clone();
        change(&mut next);
        next.updated = now;
        if next.status.is_terminal() && next.duration.is_none() {
            next.duration = Some(next.elapsed_secs(now));
        }
        self.store.save(&next)?;
        entry.task = next.clone();
        Ok(next)
    }

    /// Cancel a task. Idempotent: terminal tasks come back unchanged.
    ///
    /// Live tasks get their cancel token tripped so in-flight subprocesses
    /// and waits stop. Rows from other processes are marked `cancelled` on
    /// disk and picked up by their worker at its next poll.
    pub fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<Task>> {
        let live_token = {
            let tasks = self
                .tasks
                .read()
                .map_err(|_| anyhow!("task index lock poisoned"))?;
            tasks.get(&id).map(|entry| entry.cancel.clone())
        };

        if let Some(token) = live_token {
            let task = self.update(id, now, |task| {
                task.status = TaskStatus::Cancelled;
                task.append_output("Task cancelled by user.");
            })?;
            token.cancel();
            return Ok(Some(task));
        }

        let Some(mut task) = self.store.load(id)? else {
            return Ok(None);
        };
        if task.status.is_terminal() {
            return Ok(Some(task));
        }
        task.status = TaskStatus::Cancelled;
        task.append_output("Task cancelled by user.");
        task.updated = now;
        task.duration = Some(task.elapsed_secs(now));
        self.store.save(&task)?;
        Ok(Some(task))
    }

    /// Adopt a `cancelled` durable row written by another process: the
    /// cached row is replaced and the token tripped. Returns whether the
    /// durable row was cancelled.
    pub fn adopt_durable_cancel(&self, id: TaskId) -> Result<bool> {
        let Some(durable) = self.store.load(id)? else {
            return Ok(false);
        };
        if durable.status != TaskStatus::Cancelled {
            return Ok(false);
        }
        let mut tasks = self
            .tasks
            .write()
            .map_err(|_| anyhow!("task index lock poisoned"))?;
        if let Some(entry) = tasks.get_mut(&id) {
            entry.cancel.cancel();
            entry.task = durable;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(temp: &tempfile::TempDir) -> TaskRegistry {
        TaskRegistry::open(TaskStore::new(temp.path())).expect("open")
    }

    #[test]
    fn ids_start_at_first_and_increase() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reg = registry(&temp);
        let (a, _) = reg.create("one", Utc::now()).expect("create");
        let (b, _) = reg.create("two", Utc::now()).expect("create");
        assert_eq!(a.id, TaskId(FIRST_TASK_ID));
        assert_eq!(b.id, TaskId(FIRST_TASK_ID + 1));
    }

    #[test]
    fn ids_continue_after_persisted_rows() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let reg = registry(&temp);
            reg.create("one", Utc::now()).expect("create");
            reg.create("two", Utc::now()).expect("create");
        }
        let reopened = registry(&temp);
        let (task, _) = reopened.create("three", Utc::now()).expect("create");
        assert_eq!(task.id, TaskId(FIRST_TASK_ID + 2));
        assert!(reopened.list().expect("list").len() == 1);
        assert!(reopened.get(TaskId(FIRST_TASK_ID)).expect("get").is_some());
    }

    #[test]
    fn update_writes_through_and_stamps_duration() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reg = registry(&temp);
        let (task, _) = reg.create("goal", Utc::now()).expect("create");
        let done = reg
            .update(task.id, Utc::now(), |t| t.status = TaskStatus::Completed)
            .expect("update");
        assert!(done.duration.is_some());
        let durable = reg.store().load(task.id).expect("load").expect("row");
        assert_eq!(durable.status, TaskStatus::Completed);
    }

    #[test]
    fn terminal_tasks_ignore_further_updates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reg = registry(&temp);
        let (task, token) = reg.create("goal", Utc::now()).expect("create");
        let cancelled = reg.cancel(task.id, Utc::now()).expect("cancel").expect("task");
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(token.is_cancelled());

        let after = reg
            .update(task.id, Utc::now(), |t| t.status = TaskStatus::Completed)
            .expect("update");
        assert_eq!(after.status, TaskStatus::Cancelled);

        let again = reg.cancel(task.id, Utc::now()).expect("cancel").expect("task");
        assert_eq!(again, after);
    }

    #[test]
    fn cancel_unknown_task_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reg = registry(&temp);
        assert!(reg.cancel(TaskId(42), Utc::now()).expect("cancel").is_none());
    }

    #[test]
    fn cancel_marks_rows_owned_by_another_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let owner = registry(&temp);
        let (task, _) = owner.create("goal", Utc::now()).expect("create");

        let other = registry(&temp);
        let cancelled = other.cancel(task.id, Utc::now()).expect("cancel").expect("task");
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        let durable = owner.store().load(task.id).expect("load").expect("row");
        assert_eq!(durable.status, TaskStatus::Cancelled);
        assert!(owner.adopt_durable_cancel(task.id).expect("adopt"));
        let cached = owner.get(task.id).expect("get").expect("task");
        assert_eq!(cached.status, TaskStatus::Cancelled);
    }
}
