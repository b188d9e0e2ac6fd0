//! Worker State Store: the persisted view of this worker's tasks.
//!
//! One JSON file per worker holds every tracked task entry, the shared
//! credential cache and unconfirmed outbound notifications. The file is
//! always rewritten whole, through a temp file renamed onto the target.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use super::credentials::CredentialCache;
use crate::error::StateError;
use crate::protocol::{CompletionCallback, DispatchRequest};

/// Local view of a task's progress on this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl LocalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A task accepted by this worker. Kept until explicitly reaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTaskEntry {
    pub task_id: Uuid,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub worker_type: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub base_branch: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_secret: String,
    pub status: LocalStatus,
    #[serde(default)]
    pub session_handle: Option<String>,
    #[serde(default)]
    pub working_tree_path: Option<PathBuf>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl WorkerTaskEntry {
    /// A freshly accepted, not yet started entry.
    pub fn queued(request: &DispatchRequest) -> Self {
        Self {
            task_id: request.task_id,
            trace_id: request.trace_id.clone(),
            worker_type: request.worker_type.clone(),
            prompt: request.prompt.clone(),
            repository: request.repository.clone(),
            base_branch: request.base_branch.clone(),
            webhook_url: request.webhook_url.clone(),
            webhook_secret: request.webhook_secret.clone(),
            status: LocalStatus::Queued,
            session_handle: None,
            working_tree_path: None,
            log_path: None,
            started_at: None,
        }
    }
}

/// A callback delivery that has not been confirmed by the coordinator yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingNotification {
    pub id: Uuid,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub callback: CompletionCallback,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingNotification {
    pub fn for_entry(entry: &WorkerTaskEntry, callback: CompletionCallback) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_url: entry.webhook_url.clone(),
            webhook_secret: entry.webhook_secret.clone(),
            callback,
            created_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Everything the worker persists.
///
/// Missing fields fall back to their defaults and unknown fields are kept
/// in `extra`, so a file written by a newer build survives a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    #[serde(default)]
    pub tasks: HashMap<Uuid, WorkerTaskEntry>,
    #[serde(default)]
    pub credential_cache: Option<CredentialCache>,
    #[serde(default)]
    pub pending_notifications: Vec<PendingNotification>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl WorkerState {
    /// Working-tree paths of every tracked entry.
    pub fn tracked_working_trees(&self) -> impl Iterator<Item = &Path> {
        self.tasks
            .values()
            .filter_map(|entry| entry.working_tree_path.as_deref())
    }
}

/// The state file on disk.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state.
    ///
    /// - absent file: empty default
    /// - not valid JSON: the file is moved to a timestamped backup and the
    ///   empty default is returned
    /// - valid JSON that does not fit [`WorkerState`]: left in place and
    ///   reported as [`StateError::UnexpectedShape`]
    pub async fn load(&self) -> Result<WorkerState, StateError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WorkerState::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let value: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(e) => {
                let backup = self.quarantine().await?;
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Worker state file is corrupt, moved aside and starting empty"
                );
                return Ok(WorkerState::default());
            }
        };

        serde_json::from_value(value).map_err(|e| StateError::UnexpectedShape {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Atomically replace the state file with `state`.
    pub async fn save(&self, state: &WorkerState) -> Result<(), StateError> {
        let body = serde_json::to_vec_pretty(state)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let tmp = self.sibling(&format!("tmp-{}", std::process::id()));
        if let Err(e) = write_synced(&tmp, &body).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.io_error(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.io_error(e));
        }
        Ok(())
    }

    async fn quarantine(&self) -> Result<PathBuf, StateError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let backup = self.sibling(&format!("corrupt-{stamp}"));
        tokio::fs::rename(&self.path, &backup)
            .await
            .map_err(|e| self.io_error(e))?;
        info!(backup = %backup.display(), "Quarantined unreadable worker state");
        Ok(backup)
    }

    /// `<dir>/<file name>.<suffix>`
    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        self.path.with_file_name(format!("{name}.{suffix}"))
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

async fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(body).await?;
    file.sync_all().await
}
