//! HTTP route handlers for the engine API.
//!
//! Engine calls touch the filesystem (and the model for `/status`), so every
//! handler runs them on the blocking pool.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use prime::core::types::{Task, TaskId};
use prime::io::step_log::LogEntry;
use prime::io::store::HistoryEntry;
use prime::{Engine, EngineError, EngineResult, ModelStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::sse;
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Full application: `/api/*`, `/events` and permissive CORS.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state)
}

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/goal", post(submit_goal))
        .route("/tasks", get(list_tasks))
        .route("/task/{id}", get(get_task))
        .route("/task/{id}/cancel", post(cancel_task))
        .route("/history", get(history))
        .route("/task_logs/{id}", get(task_logs))
        .route("/task_log/{id}/{filename}", get(task_log))
}

/// JSON error body `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err {
            EngineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidGoal(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(err = %err, "request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn blocking<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&Engine) -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || op(&engine))
        .await
        .map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("engine call aborted: {err}"),
            )
        })?
        .map_err(ApiError::from)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_secs: u64,
    active_tasks: usize,
    model: ModelStatus,
}

/// GET /api/status - engine liveness plus model reachability.
async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let uptime_secs = state.started.elapsed().as_secs();
    let (active_tasks, model) = blocking(&state, |engine| {
        let active = engine
            .tasks()?
            .iter()
            .filter(|task| !task.status.is_terminal())
            .count();
        Ok((active, engine.model_status()))
    })
    .await?;
    Ok(Json(StatusResponse {
        status: "running",
        uptime_secs,
        active_tasks,
        model,
    }))
}

/// Accepts `{"goal": ...}` or `{"text": ...}`.
#[derive(Debug, Deserialize)]
struct GoalRequest {
    goal: Option<String>,
    text: Option<String>,
}

/// POST /api/goal - create a task and start it in the background.
async fn submit_goal(
    State(state): State<AppState>,
    Json(body): Json<GoalRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let Some(goal) = body.goal.or(body.text) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "request body needs a goal",
        ));
    };
    let id = blocking(&state, move |engine| engine.submit(&goal)).await?;
    info!(task_id = %id, "goal accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": id.to_string() })),
    ))
}

/// GET /api/tasks - tasks known to this server process.
async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    blocking(&state, |engine| engine.tasks()).await.map(Json)
}

/// GET /api/task/{id}
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Task>, ApiError> {
    blocking(&state, move |engine| engine.task(TaskId(id)))
        .await
        .map(Json)
}

/// POST /api/task/{id}/cancel - idempotent.
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Task>, ApiError> {
    blocking(&state, move |engine| engine.cancel(TaskId(id)))
        .await
        .map(Json)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// GET /api/history?limit=N - finished tasks, newest first.
async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    blocking(&state, move |engine| engine.history(limit))
        .await
        .map(Json)
}

/// GET /api/task_logs/{id} - step log index.
async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    blocking(&state, move |engine| engine.task_logs(TaskId(id)))
        .await
        .map(Json)
}

/// GET /api/task_log/{id}/{filename} - one artifact as markdown text.
async fn task_log(
    State(state): State<AppState>,
    Path((id, filename)): Path<(u64, String)>,
) -> Result<String, ApiError> {
    let lookup = filename.clone();
    blocking(&state, move |engine| engine.task_log(TaskId(id), &lookup))
        .await?
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("log file {filename} not found for task {id}"),
            )
        })
}
