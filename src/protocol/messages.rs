//! Wire messages exchanged between the coordinator and workers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{TaskRecord, TaskStatus};

/// Coordinator → worker: run this task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub task_id: Uuid,
    pub trace_id: String,
    pub worker_type: String,
    pub prompt: String,
    pub repository: String,
    pub base_branch: String,
    /// Where the worker posts progress and completion callbacks.
    pub webhook_url: String,
    /// Per-task secret the worker signs callbacks with.
    pub webhook_secret: String,
}

impl DispatchRequest {
    pub fn for_task(
        task: &TaskRecord,
        worker_location: &str,
        webhook_url: String,
        webhook_secret: String,
    ) -> Self {
        Self {
            task_id: task.id,
            trace_id: task.trace_id.clone(),
            worker_type: worker_location.to_string(),
            prompt: task.sanitized_prompt.clone(),
            repository: task.repository.clone(),
            base_branch: task.base_branch.clone(),
            webhook_url,
            webhook_secret,
        }
    }
}

/// Worker → coordinator: reply to a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptResponse {
    pub task_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub session_handle: Option<String>,
}

/// Coordinator → worker: stop this task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub task_id: Uuid,
    pub worker_location: String,
}

/// Status a worker may report through the callback endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    /// Progress: the agent is running (also used as a heartbeat).
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CallbackStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl From<CallbackStatus> for TaskStatus {
    fn from(status: CallbackStatus) -> Self {
        match status {
            CallbackStatus::Running => TaskStatus::Running,
            CallbackStatus::Completed => TaskStatus::Completed,
            CallbackStatus::Failed => TaskStatus::Failed,
            CallbackStatus::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Worker → coordinator: progress or final status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionCallback {
    pub task_id: Uuid,
    pub status: CallbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One bounded fragment of a task's log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    pub task_id: Uuid,
    pub sequence: u64,
    pub content: String,
}
