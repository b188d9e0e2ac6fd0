//! Task record data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TaskStatus;

/// Which worker should run a task.
///
/// Serialized as a plain string: `"auto"` or the worker's location name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkerType {
    /// Let the coordinator pick by its selection policy.
    #[default]
    Auto,
    /// A specific configured worker location.
    Named(String),
}

impl From<String> for WorkerType {
    fn from(s: String) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            Self::Auto
        } else {
            Self::Named(trimmed.to_string())
        }
    }
}

impl From<WorkerType> for String {
    fn from(w: WorkerType) -> Self {
        match w {
            WorkerType::Auto => "auto".to_string(),
            WorkerType::Named(name) => name,
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Incoming request to create a task. The caller identity is supplied
/// separately, already validated by the intake layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub prompt: String,
    #[serde(default)]
    pub sanitized_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_hash: Option<String>,
    pub repository: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub worker_type: WorkerType,
    /// Idempotency key for retried requests.
    pub dedup_key: String,
    #[serde(default)]
    pub trace_id: Option<String>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl CreateTaskRequest {
    pub fn new(
        prompt: impl Into<String>,
        repository: impl Into<String>,
        dedup_key: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            sanitized_prompt: None,
            system_prompt_hash: None,
            repository: repository.into(),
            base_branch: default_base_branch(),
            worker_type: WorkerType::Auto,
            dedup_key: dedup_key.into(),
            trace_id: None,
        }
    }

    pub fn with_worker(mut self, worker_type: WorkerType) -> Self {
        self.worker_type = worker_type;
        self
    }
}

/// The canonical task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: Uuid,
    pub trace_id: String,
    pub user_id: String,
    pub prompt: String,
    pub sanitized_prompt: String,
    pub system_prompt_hash: Option<String>,
    pub repository: String,
    pub base_branch: String,
    pub worker_type: WorkerType,
    pub dedup_key: String,
    /// Resolved at dispatch time.
    pub worker_location: Option<String>,
    pub status: TaskStatus,
    /// Set once the worker's completion callback has been processed.
    pub callback_received: bool,
    /// Result payload from the completion callback, if any.
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Build a new `pending` record for `user_id`.
    pub fn new(user_id: impl Into<String>, request: CreateTaskRequest) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let sanitized_prompt = request
            .sanitized_prompt
            .unwrap_or_else(|| sanitize_prompt(&request.prompt));
        Self {
            id,
            trace_id: request.trace_id.unwrap_or_else(|| id.to_string()),
            user_id: user_id.into(),
            prompt: request.prompt,
            sanitized_prompt,
            system_prompt_hash: request.system_prompt_hash,
            repository: request.repository,
            base_branch: request.base_branch,
            worker_type: request.worker_type,
            dedup_key: request.dedup_key,
            worker_location: None,
            status: TaskStatus::Pending,
            callback_received: false,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether `user_id` owns this task.
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

/// Check that `repository` is a relative path of plain components, so it
/// can be joined onto a worker's repository root.
pub fn validate_repository(repository: &str) -> Result<(), String> {
    if repository.trim().is_empty() {
        return Err("repository is empty".into());
    }
    if repository.starts_with('/') || repository.starts_with('\\') || repository.contains(':') {
        return Err(format!("repository {repository} must be a relative path"));
    }
    let bad_component = repository
        .split(['/', '\\'])
        .any(|c| c.is_empty() || c == "." || c == "..");
    if bad_component {
        return Err(format!(
            "repository {repository} has an empty or relative path component"
        ));
    }
    Ok(())
}

/// Strip control characters other than newlines and tabs.
pub fn sanitize_prompt(prompt: &str) -> String {
    prompt
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}
