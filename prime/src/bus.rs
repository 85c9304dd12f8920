//! Fan-out of task transitions to subscribers (SSE clients, CLI followers).
//!
//! Delivery is best-effort: a subscriber that falls behind the channel
//! capacity loses the oldest events and is expected to reconcile by polling.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::types::{Task, TaskId};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskUpdate,
    TaskComplete,
}

/// Payload pushed to subscribers on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub id: TaskId,
    pub status: String,
    pub output: String,
    pub step: u32,
}

impl Notification {
    pub fn for_task(task: &Task) -> Self {
        let kind = if task.status.is_terminal() {
            NotificationKind::TaskComplete
        } else {
            NotificationKind::TaskUpdate
        };
        Self {
            kind,
            id: task.id,
            status: task.status.to_string(),
            output: task.output.clone(),
            step: task.step,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, task: &Task) {
        let notification = Notification::for_task(task);
        // No receivers is not an error.
        if self.tx.send(notification).is_err() {
            trace!(task_id = %task.id, "no subscribers for notification");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::types::TaskStatus;

    #[test]
    fn subscribers_receive_typed_payloads() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();
        let mut task = Task::new(TaskId(100_000_001), "goal", Utc::now());
        task.status = TaskStatus::Running { step: 1 };
        task.step = 1;
        bus.publish(&task);
        task.status = TaskStatus::Completed;
        bus.publish(&task);

        let first = rx.try_recv().expect("first");
        assert_eq!(first.kind, NotificationKind::TaskUpdate);
        assert_eq!(first.status, "running(step=1)");
        let second = rx.try_recv().expect("second");
        assert_eq!(second.kind, NotificationKind::TaskComplete);

        let json = serde_json::to_value(&second).expect("json");
        assert_eq!(json["type"], "task_complete");
        assert_eq!(json["id"], 100_000_001);
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = NotificationBus::new();
        let task = Task::new(TaskId(1), "goal", Utc::now());
        bus.publish(&task);
    }
}
