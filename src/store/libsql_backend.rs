//! libSQL backend: async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC strings so they compare correctly as text.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::protocol::LogChunk;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::task::{TaskRecord, TaskStatus, WorkerType};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_tasks(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op} row: {e}"))),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, trace_id, user_id, prompt, sanitized_prompt, system_prompt_hash, repository, base_branch, worker_type, dedup_key, worker_location, status, callback_received, result, created_at, updated_at";

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

/// Render statuses as an SQL `IN` list. Values come from a closed enum.
fn status_list(statuses: &[TaskStatus]) -> String {
    if statuses.is_empty() {
        return "NULL".to_string();
    }
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reject a conditional write the task state machine does not allow.
fn check_transitions(from: &[TaskStatus], to: TaskStatus) -> Result<(), DatabaseError> {
    match from.iter().find(|f| !f.can_transition_to(to)) {
        Some(&from) => Err(DatabaseError::IllegalTransition { from, to }),
        None => Ok(()),
    }
}

fn map_write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

/// Map a libsql Row to a TaskRecord. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("task column {idx}: {e}")))
    };

    let id_str = get_text(0)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("bad task id {id_str}: {e}")))?;
    let status_str = get_text(11)?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;
    let result = match row.get::<String>(13).ok() {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("task result: {e}")))?,
        ),
        None => None,
    };

    Ok(TaskRecord {
        id,
        trace_id: get_text(1)?,
        user_id: get_text(2)?,
        prompt: get_text(3)?,
        sanitized_prompt: get_text(4)?,
        system_prompt_hash: row.get::<String>(5).ok(),
        repository: get_text(6)?,
        base_branch: get_text(7)?,
        worker_type: WorkerType::from(get_text(8)?),
        dedup_key: get_text(9)?,
        worker_location: row.get::<String>(10).ok(),
        status,
        callback_received: row.get::<i64>(12).unwrap_or(0) != 0,
        result,
        created_at: parse_datetime(&get_text(14)?),
        updated_at: parse_datetime(&get_text(15)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
        let result_json = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    task.id.to_string(),
                    task.trace_id.as_str(),
                    task.user_id.as_str(),
                    task.prompt.as_str(),
                    task.sanitized_prompt.as_str(),
                    opt_text(task.system_prompt_hash.as_deref()),
                    task.repository.as_str(),
                    task.base_branch.as_str(),
                    task.worker_type.to_string(),
                    task.dedup_key.as_str(),
                    opt_text(task.worker_location.as_deref()),
                    task.status.as_str(),
                    task.callback_received as i64,
                    opt_text(result_json.as_deref()),
                    format_datetime(&task.created_at),
                    format_datetime(&task.updated_at),
                ],
            )
            .await
            .map_err(|e| map_write_error("insert_task", e))?;

        debug!(task_id = %task.id, dedup_key = %task.dedup_key, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                "get_task",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn find_task_by_dedup_key(
        &self,
        dedup_key: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE dedup_key = ?1"),
                params![dedup_key],
                "find_task_by_dedup_key",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn transition_task(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        worker_location: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        check_transitions(from, to)?;
        let now = format_datetime(&Utc::now());
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET status = ?1, updated_at = ?2, worker_location = COALESCE(?3, worker_location)
                     WHERE id = ?4 AND status IN ({})",
                    status_list(from)
                ),
                params![to.as_str(), now, opt_text(worker_location), id.to_string()],
            )
            .await
            .map_err(|e| map_write_error("transition_task", e))?;

        debug!(task_id = %id, to = %to, changed, "Task transition");
        Ok(changed > 0)
    }

    async fn transition_if_stale(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        check_transitions(from, to)?;
        let now = format_datetime(&Utc::now());
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET status = ?1, updated_at = ?2
                     WHERE id = ?3 AND status IN ({}) AND updated_at < ?4",
                    status_list(from)
                ),
                params![to.as_str(), now, id.to_string(), format_datetime(&cutoff)],
            )
            .await
            .map_err(|e| map_write_error("transition_if_stale", e))?;

        debug!(task_id = %id, to = %to, changed, "Stale task transition");
        Ok(changed > 0)
    }

    async fn finalize_task(
        &self,
        id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        result: Option<&serde_json::Value>,
    ) -> Result<bool, DatabaseError> {
        check_transitions(from, to)?;
        let result_json = result
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = format_datetime(&Utc::now());

        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET status = ?1, callback_received = 1, result = ?2, updated_at = ?3
                     WHERE id = ?4 AND status IN ({})",
                    status_list(from)
                ),
                params![to.as_str(), opt_text(result_json.as_deref()), now, id.to_string()],
            )
            .await
            .map_err(|e| map_write_error("finalize_task", e))?;

        debug!(task_id = %id, to = %to, changed, "Task finalized");
        Ok(changed > 0)
    }

    async fn mark_callback_received(&self, id: Uuid) -> Result<(), DatabaseError> {
        let now = format_datetime(&Utc::now());
        self.conn()
            .execute(
                "UPDATE tasks SET callback_received = 1, updated_at = ?1 WHERE id = ?2",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| map_write_error("mark_callback_received", e))?;
        Ok(())
    }

    async fn list_stale_tasks(
        &self,
        statuses: &[TaskStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ({}) AND updated_at < ?1 ORDER BY updated_at ASC",
                status_list(statuses)
            ),
            params![format_datetime(&cutoff)],
            "list_stale_tasks",
        )
        .await
    }

    async fn count_active_by_worker(&self) -> Result<HashMap<String, usize>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT worker_location, COUNT(*) FROM tasks
                     WHERE status IN ({}) AND worker_location IS NOT NULL
                     GROUP BY worker_location",
                    status_list(&TaskStatus::ACTIVE)
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_active_by_worker: {e}")))?;

        let mut counts = HashMap::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let location: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("count_active_by_worker: {e}")))?;
                    let count: i64 = row.get(1).unwrap_or(0);
                    counts.insert(location, count.max(0) as usize);
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(DatabaseError::Query(format!("count_active_by_worker row: {e}")));
                }
            }
        }
        Ok(counts)
    }

    async fn append_log_chunk(&self, chunk: &LogChunk) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO task_log_chunks (task_id, sequence, content) VALUES (?1, ?2, ?3)",
                params![
                    chunk.task_id.to_string(),
                    chunk.sequence as i64,
                    chunk.content.as_str()
                ],
            )
            .await
            .map_err(|e| map_write_error("append_log_chunk", e))?;
        Ok(inserted > 0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CreateTaskRequest;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_task(dedup_key: &str) -> TaskRecord {
        TaskRecord::new(
            "user-1",
            CreateTaskRequest::new("fix the flaky test", "org/repo", dedup_key),
        )
    }

    #[tokio::test]
    async fn insert_and_get_by_id() {
        let db = test_db().await;
        let task = make_task("k1");
        db.insert_task(&task).await.unwrap();

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.worker_type, WorkerType::Auto);
        assert_eq!(fetched.repository, "org/repo");
        assert!(fetched.worker_location.is_none());
        assert!(fetched.result.is_none());
        assert_eq!(
            format_datetime(&fetched.created_at),
            format_datetime(&task.created_at)
        );
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let db = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedup_key_is_unique() {
        let db = test_db().await;
        db.insert_task(&make_task("same")).await.unwrap();
        let err = db.insert_task(&make_task("same")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)), "{err:?}");

        let found = db.find_task_by_dedup_key("same").await.unwrap();
        assert!(found.is_some());
        assert!(db.find_task_by_dedup_key("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_is_conditional_on_status() {
        let db = test_db().await;
        let task = make_task("k");
        db.insert_task(&task).await.unwrap();

        let moved = db
            .transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Dispatched, Some("mac"))
            .await
            .unwrap();
        assert!(moved);

        // Not pending any more, so a second dispatch is a no-op.
        let again = db
            .transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Dispatched, Some("vm"))
            .await
            .unwrap();
        assert!(!again);

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Dispatched);
        assert_eq!(fetched.worker_location.as_deref(), Some("mac"));
    }

    #[tokio::test]
    async fn writes_outside_the_state_machine_are_rejected() {
        let db = test_db().await;
        let task = make_task("k");
        db.insert_task(&task).await.unwrap();

        let err = db
            .transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::IllegalTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Running
            }
        ));

        let err = db
            .finalize_task(task.id, &[TaskStatus::Completed], TaskStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::IllegalTransition { .. }));

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn stale_transition_skips_refreshed_tasks() {
        let db = test_db().await;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::minutes(30);

        let mut task = make_task("k");
        task.status = TaskStatus::Running;
        task.updated_at = now - chrono::Duration::minutes(45);
        db.insert_task(&task).await.unwrap();

        // A progress callback lands after the stale query but before the write.
        db.transition_task(task.id, &TaskStatus::ACTIVE, TaskStatus::Running, None)
            .await
            .unwrap();
        let moved = db
            .transition_if_stale(task.id, &TaskStatus::ACTIVE, TaskStatus::Interrupted, cutoff)
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(
            db.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );

        let mut old = make_task("old");
        old.status = TaskStatus::Dispatched;
        old.updated_at = now - chrono::Duration::minutes(45);
        db.insert_task(&old).await.unwrap();
        assert!(
            db.transition_if_stale(old.id, &TaskStatus::ACTIVE, TaskStatus::Interrupted, cutoff)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn finalize_sets_callback_and_result() {
        let db = test_db().await;
        let task = make_task("k");
        db.insert_task(&task).await.unwrap();
        db.transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Dispatched, Some("mac"))
            .await
            .unwrap();

        let result = serde_json::json!({"branch": "task/abc"});
        let done = db
            .finalize_task(task.id, &TaskStatus::ACTIVE, TaskStatus::Completed, Some(&result))
            .await
            .unwrap();
        assert!(done);

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert!(fetched.callback_received);
        assert_eq!(fetched.result, Some(result));
    }

    #[tokio::test]
    async fn stale_query_respects_cutoff_and_status() {
        let db = test_db().await;
        let now = Utc::now();

        let mut old_running = make_task("old");
        old_running.status = TaskStatus::Running;
        old_running.updated_at = now - chrono::Duration::minutes(31);
        db.insert_task(&old_running).await.unwrap();

        let mut fresh_running = make_task("fresh");
        fresh_running.status = TaskStatus::Running;
        fresh_running.updated_at = now - chrono::Duration::minutes(10);
        db.insert_task(&fresh_running).await.unwrap();

        let mut old_done = make_task("done");
        old_done.status = TaskStatus::Completed;
        old_done.updated_at = now - chrono::Duration::hours(2);
        db.insert_task(&old_done).await.unwrap();

        let stale = db
            .list_stale_tasks(&TaskStatus::ACTIVE, now - chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old_running.id);
    }

    #[tokio::test]
    async fn counts_active_tasks_per_worker() {
        let db = test_db().await;
        for (key, location, status) in [
            ("a", "mac", TaskStatus::Running),
            ("b", "mac", TaskStatus::Dispatched),
            ("c", "vm", TaskStatus::Running),
            ("d", "vm", TaskStatus::Completed),
        ] {
            let mut task = make_task(key);
            task.status = status;
            task.worker_location = Some(location.to_string());
            db.insert_task(&task).await.unwrap();
        }

        let counts = db.count_active_by_worker().await.unwrap();
        assert_eq!(counts.get("mac"), Some(&2));
        assert_eq!(counts.get("vm"), Some(&1));
    }

    #[tokio::test]
    async fn log_chunks_are_idempotent_per_sequence() {
        let db = test_db().await;
        let chunk = LogChunk {
            task_id: Uuid::new_v4(),
            sequence: 0,
            content: "hello\n".into(),
        };
        assert!(db.append_log_chunk(&chunk).await.unwrap());
        assert!(!db.append_log_chunk(&chunk).await.unwrap());

        let next = LogChunk {
            sequence: 1,
            ..chunk.clone()
        };
        assert!(db.append_log_chunk(&next).await.unwrap());
    }

    #[tokio::test]
    async fn opens_file_database_in_nested_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("relay.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.insert_task(&make_task("k")).await.unwrap();
        assert!(path.exists());
    }
}
