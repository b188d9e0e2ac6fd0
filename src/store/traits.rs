//! `TaskStore` trait: the durable metadata store the coordinator consumes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::protocol::LogChunk;
use crate::task::{TaskRecord, TaskStatus};

/// Backend-agnostic store for task records and shipped log chunks.
///
/// Status-changing writes are conditional on the current status so that
/// concurrent writers (callbacks, cancels, the reconciler) cannot move a
/// task out of a terminal state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task. Fails with `Constraint` if `dedup_key` is taken.
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;

    async fn find_task_by_dedup_key(
        &self,
        dedup_key: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Move a task to `to` if its current status is one of `from`.
    ///
    /// Sets `worker_location` when given and always bumps `updated_at`.
    /// Returns `false` when the task was not in an allowed status. Fails
    /// with `IllegalTransition` if any `from` status may not move to `to`.
    async fn transition_task(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        worker_location: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Like [`transition_task`](Self::transition_task), but only if the
    /// task's `updated_at` is still before `cutoff`.
    async fn transition_if_stale(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move a task to a final status on behalf of its completion callback,
    /// setting `callback_received` and the result payload in the same write.
    async fn finalize_task(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        result: Option<&serde_json::Value>,
    ) -> Result<bool, DatabaseError>;

    /// Set `callback_received` without touching status.
    async fn mark_callback_received(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Tasks in any of `statuses` whose `updated_at` is before `cutoff`.
    async fn list_stale_tasks(
        &self,
        statuses: &[TaskStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Number of dispatched/running tasks per worker location.
    async fn count_active_by_worker(&self) -> Result<HashMap<String, usize>, DatabaseError>;

    // ── Log chunks ──────────────────────────────────────────────────

    /// Append a log chunk. Returns `false` if `(task_id, sequence)` was
    /// already stored, so retried uploads are idempotent.
    async fn append_log_chunk(&self, chunk: &LogChunk) -> Result<bool, DatabaseError>;
}
