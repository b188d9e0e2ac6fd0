//! Worker HTTP surface: signed dispatch and cancel from the coordinator.
//!
//! Every route except `/health` requires the dispatch signature. Task
//! entries are returned as [`TaskView`], which leaves out the prompt and
//! the per-task callback secret.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use secrecy::{ExposeSecret, SecretString};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use super::runtime::WorkerRuntime;
use super::state::{LocalStatus, WorkerTaskEntry};
use crate::error::WorkerError;
use crate::protocol::{CancelRequest, DispatchRequest, verify_headers};

/// Shared state for worker handlers.
#[derive(Clone)]
pub struct WorkerAppState {
    pub runtime: Arc<WorkerRuntime>,
    /// Secret the coordinator signs dispatch and cancel calls with.
    pub dispatch_secret: SecretString,
}

pub fn worker_routes(runtime: Arc<WorkerRuntime>, dispatch_secret: SecretString) -> Router {
    let state = WorkerAppState {
        runtime,
        dispatch_secret,
    };

    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(accept_task).get(list_tasks))
        .route("/tasks/{id}", delete(reap_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/worktrees/orphans", get(list_orphans))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// A task entry as reported over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: Uuid,
    pub trace_id: String,
    pub worker_type: String,
    pub repository: String,
    pub base_branch: String,
    pub status: LocalStatus,
    pub session_handle: Option<String>,
    pub working_tree_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<WorkerTaskEntry> for TaskView {
    fn from(entry: WorkerTaskEntry) -> Self {
        Self {
            task_id: entry.task_id,
            trace_id: entry.trace_id,
            worker_type: entry.worker_type,
            repository: entry.repository,
            base_branch: entry.base_branch,
            status: entry.status,
            session_handle: entry.session_handle,
            working_tree_path: entry.working_tree_path,
            log_path: entry.log_path,
            started_at: entry.started_at,
        }
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let status = match &self {
            WorkerError::UnknownTask { .. } => StatusCode::NOT_FOUND,
            WorkerError::StillActive { .. } => StatusCode::CONFLICT,
            WorkerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            WorkerError::Credential(_)
            | WorkerError::Callback(_)
            | WorkerError::CallbackRejected { .. } => StatusCode::BAD_GATEWAY,
            WorkerError::WorkingTree(_) | WorkerError::Launch(_) | WorkerError::State(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_body(status, self.to_string())
    }
}

/// Check the dispatch signature over `body`.
fn authorized(state: &WorkerAppState, headers: &HeaderMap, body: &[u8]) -> Result<(), Response> {
    verify_headers(headers, state.dispatch_secret.expose_secret().as_bytes(), body).map_err(|e| {
        warn!(error = %e, "Rejected unsigned or mis-signed request");
        error_body(StatusCode::UNAUTHORIZED, e.to_string())
    })
}

/// Check the signature and decode the body.
fn signed<T: DeserializeOwned>(
    state: &WorkerAppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, Response> {
    authorized(state, headers, body)?;
    serde_json::from_slice(body).map_err(|e| error_body(StatusCode::BAD_REQUEST, e.to_string()))
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<WorkerAppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "task-relay-worker",
        "location": state.runtime.location(),
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn accept_task(
    State(state): State<WorkerAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: DispatchRequest = match signed(&state, &headers, &body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    match state.runtime.accept(request).await {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cancel_task(
    State(state): State<WorkerAppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let request: CancelRequest = match signed(&state, &headers, &body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    if request.task_id != id {
        return error_body(StatusCode::BAD_REQUEST, "Task ID mismatch");
    }
    if request.worker_location != state.runtime.location() {
        warn!(
            task_id = %id,
            requested = %request.worker_location,
            "Cancel addressed to another worker location"
        );
    }
    match state.runtime.cancel(id).await {
        Ok(entry) => Json(TaskView::from(entry)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn reap_task(
    State(state): State<WorkerAppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorized(&state, &headers, &body) {
        return resp;
    }
    match state.runtime.reap(id).await {
        Ok(entry) => Json(TaskView::from(entry)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_tasks(
    State(state): State<WorkerAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = authorized(&state, &headers, &body) {
        return resp;
    }
    let tasks: Vec<TaskView> = state
        .runtime
        .list()
        .await
        .into_iter()
        .map(TaskView::from)
        .collect();
    Json(tasks).into_response()
}

#[derive(Deserialize)]
struct OrphanQuery {
    repository: String,
}

async fn list_orphans(
    State(state): State<WorkerAppState>,
    Query(query): Query<OrphanQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = authorized(&state, &headers, &body) {
        return resp;
    }
    match state.runtime.orphan_worktrees(&query.repository).await {
        Ok(orphans) => Json(serde_json::json!({
            "repository": query.repository,
            "orphans": orphans,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}
