//! Coordinator HTTP surface.
//!
//! `/api/*` is the user-facing task API, identified by the `x-user-id`
//! header set by the gateway in front of it. `/internal/*` is for workers
//! and operators and requires a signed body.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use super::lifecycle::TaskCoordinator;
use crate::error::{DispatchError, TaskError};
use crate::protocol::{CompletionCallback, LogChunk, verify_headers};
use crate::task::CreateTaskRequest;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state for coordinator handlers.
#[derive(Clone)]
pub struct CoordinatorAppState {
    pub coordinator: Arc<TaskCoordinator>,
}

pub fn coordinator_routes(coordinator: Arc<TaskCoordinator>) -> Router {
    let state = CoordinatorAppState { coordinator };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/internal/webhooks/tasks/{id}", post(task_callback))
        .route("/internal/logs", post(ingest_logs))
        .route("/internal/reconcile", post(reconcile))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let status = match &self {
            TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
            TaskError::Forbidden { .. } => StatusCode::FORBIDDEN,
            TaskError::NotRunning { .. } | TaskError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            TaskError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            TaskError::Dispatch { source, .. } => match source {
                DispatchError::UnknownWorker(_) => StatusCode::BAD_REQUEST,
                DispatchError::NoWorkers => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
            TaskError::Internal(e) => {
                warn!(error = %e, "Store failure while handling request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_body(status, self.to_string())
    }
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

fn user_id(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| error_body(StatusCode::UNAUTHORIZED, "Missing x-user-id header"))
}

/// Check the body's signature against `secret` and decode it.
fn signed<T: DeserializeOwned>(
    headers: &HeaderMap,
    secret: &[u8],
    body: &[u8],
) -> Result<T, Response> {
    verify_headers(headers, secret, body).map_err(|e| {
        warn!(error = %e, "Rejected unsigned or mis-signed request");
        error_body(StatusCode::UNAUTHORIZED, e.to_string())
    })?;
    serde_json::from_slice(body).map_err(|e| error_body(StatusCode::BAD_REQUEST, e.to_string()))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<CoordinatorAppState>) -> impl IntoResponse {
    let workers: Vec<&str> = state
        .coordinator
        .config()
        .workers
        .iter()
        .map(|w| w.name.as_str())
        .collect();
    Json(serde_json::json!({
        "status": "ok",
        "service": "task-relay-coordinator",
        "workers": workers,
    }))
}

// ── Task API ────────────────────────────────────────────────────────────

async fn create_task(
    State(state): State<CoordinatorAppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> Response {
    let user = match user_id(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match state.coordinator.submit(&user, request).await {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_task(
    State(state): State<CoordinatorAppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let (id, user) = match parse_id(&id).and_then(|id| Ok((id, user_id(&headers)?))) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    match state.coordinator.get(id, &user).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn cancel_task(
    State(state): State<CoordinatorAppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let (id, user) = match parse_id(&id).and_then(|id| Ok((id, user_id(&headers)?))) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    match state.coordinator.cancel(id, &user).await {
        Ok(task) => Json(serde_json::json!({
            "success": true,
            "taskId": task.id,
            "status": task.status,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Worker-facing ───────────────────────────────────────────────────────

async fn task_callback(
    State(state): State<CoordinatorAppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let secret = state.coordinator.task_secret(id);
    let callback: CompletionCallback = match signed(&headers, secret.as_bytes(), &body) {
        Ok(callback) => callback,
        Err(resp) => return resp,
    };
    match state.coordinator.handle_callback(id, callback).await {
        Ok(task) => Json(serde_json::json!({
            "taskId": task.id,
            "status": task.status,
            "callbackReceived": task.callback_received,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn ingest_logs(
    State(state): State<CoordinatorAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = state.coordinator.config().dispatch_secret.expose_secret();
    let chunk: LogChunk = match signed(&headers, secret.as_bytes(), &body) {
        Ok(chunk) => chunk,
        Err(resp) => return resp,
    };
    match state.coordinator.ingest_log_chunk(&chunk).await {
        Ok(stored) => Json(serde_json::json!({ "stored": stored })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn reconcile(
    State(state): State<CoordinatorAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = state.coordinator.config().dispatch_secret.expose_secret();
    if let Err(e) = verify_headers(&headers, secret.as_bytes(), &body) {
        return error_body(StatusCode::UNAUTHORIZED, e.to_string());
    }
    match state.coordinator.reconcile().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => e.into_response(),
    }
}
