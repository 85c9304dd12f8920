//! Server-Sent Events stream of task notifications.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use prime::bus::{Notification, NotificationKind};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::AppState;

/// SSE endpoint handler.
///
/// Each bus notification becomes one event named after its type
/// (`task_update` / `task_complete`) carrying the JSON payload.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.engine.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(notification) => {
                    if let Some(event) = to_event(&notification) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("notification bus closed");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_event(notification: &Notification) -> Option<Event> {
    let json = serde_json::to_string(notification).ok()?;
    let name = match notification.kind {
        NotificationKind::TaskUpdate => "task_update",
        NotificationKind::TaskComplete => "task_complete",
    };
    Some(Event::default().event(name).data(json))
}

#[cfg(test)]
mod tests {
    use prime::core::types::TaskId;

    use super::*;

    #[test]
    fn payload_carries_type_and_status() {
        let notification = Notification {
            kind: NotificationKind::TaskComplete,
            id: TaskId(100_000_001),
            status: "completed".to_string(),
            output: "done".to_string(),
            step: 2,
        };

        let json = serde_json::to_value(&notification).expect("serialize notification");
        assert_eq!(json["type"], "task_complete");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["step"], 2);
        assert!(to_event(&notification).is_some());
    }
}
