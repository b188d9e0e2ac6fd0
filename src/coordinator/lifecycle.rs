//! Task Lifecycle Coordinator: create, dispatch, cancel and callbacks.
//!
//! The durable store is the source of truth. Every status write is
//! conditional on the status the caller observed, so callbacks, cancels and
//! the reconciler can race without moving a task out of a terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::WorkerClient;
use super::selection::WorkerRegistry;
use crate::config::CoordinatorConfig;
use crate::error::{DatabaseError, DispatchError, TaskError};
use crate::protocol::{
    CallbackStatus, CancelRequest, CompletionCallback, DispatchRequest, LogChunk,
    derive_task_secret,
};
use crate::store::TaskStore;
use crate::task::{CreateTaskRequest, TaskRecord, TaskStatus, validate_repository};

/// Collaborators the coordinator is built from.
pub struct CoordinatorDeps {
    pub store: Arc<dyn TaskStore>,
    pub client: Arc<dyn WorkerClient>,
    pub config: CoordinatorConfig,
}

pub struct TaskCoordinator {
    pub(super) store: Arc<dyn TaskStore>,
    client: Arc<dyn WorkerClient>,
    registry: WorkerRegistry,
    pub(super) config: CoordinatorConfig,
    /// Serializes reconciliation runs.
    pub(super) reconcile_lock: Mutex<()>,
    /// Per-task claims held for the whole worker call of a dispatch.
    dispatch_claims: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TaskCoordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        let registry =
            WorkerRegistry::new(deps.config.workers.clone(), deps.config.selection_policy);
        Self {
            store: deps.store,
            client: deps.client,
            registry,
            config: deps.config,
            reconcile_lock: Mutex::new(()),
            dispatch_claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Secret the worker signs callbacks for `task_id` with.
    pub fn task_secret(&self, task_id: Uuid) -> String {
        derive_task_secret(self.config.webhook_secret.expose_secret().as_bytes(), task_id)
    }

    fn webhook_url(&self, task_id: Uuid) -> String {
        format!(
            "{}/internal/webhooks/tasks/{task_id}",
            self.config.public_url.trim_end_matches('/')
        )
    }

    // ── Create / dispatch ───────────────────────────────────────────────

    /// Persist a new `pending` task, or return the one already created
    /// with the same dedup key.
    pub async fn create(
        &self,
        user_id: &str,
        request: CreateTaskRequest,
    ) -> Result<TaskRecord, TaskError> {
        if request.prompt.trim().is_empty() {
            return Err(TaskError::InvalidRequest("prompt is empty".into()));
        }
        validate_repository(&request.repository).map_err(TaskError::InvalidRequest)?;
        if request.dedup_key.trim().is_empty() {
            return Err(TaskError::InvalidRequest("dedupKey is empty".into()));
        }

        if let Some(existing) = self.store.find_task_by_dedup_key(&request.dedup_key).await? {
            return self.existing_for(user_id, existing);
        }

        let dedup_key = request.dedup_key.clone();
        let task = TaskRecord::new(user_id, request);
        match self.store.insert_task(&task).await {
            Ok(()) => {
                info!(
                    task_id = %task.id,
                    trace_id = %task.trace_id,
                    user_id = %user_id,
                    repository = %task.repository,
                    "Task created"
                );
                Ok(task)
            }
            // Lost a race with a concurrent create for the same key.
            Err(DatabaseError::Constraint(_)) => {
                match self.store.find_task_by_dedup_key(&dedup_key).await? {
                    Some(existing) => self.existing_for(user_id, existing),
                    None => Err(TaskError::Internal(DatabaseError::Constraint(format!(
                        "dedup key {dedup_key} conflicted but no task holds it"
                    )))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn existing_for(&self, user_id: &str, existing: TaskRecord) -> Result<TaskRecord, TaskError> {
        if !existing.is_owned_by(user_id) {
            return Err(TaskError::Forbidden { id: existing.id });
        }
        debug!(task_id = %existing.id, dedup_key = %existing.dedup_key, "Dedup key already used, returning existing task");
        Ok(existing)
    }

    /// Hand a `pending` task to a worker and record it as `dispatched`.
    ///
    /// On any failure the task stays `pending`, so dispatch can be retried.
    pub async fn dispatch(&self, task_id: Uuid) -> Result<TaskRecord, TaskError> {
        let claim = self.claim_dispatch(task_id).await;
        let result = match self.load(task_id).await {
            Ok(task) if task.status == TaskStatus::Pending => self.dispatch_claimed(task).await,
            Ok(task) => Err(TaskError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::Dispatched,
            }),
            Err(e) => Err(e),
        };
        self.release_dispatch(task_id, claim).await;
        result
    }

    /// Create a task and dispatch it if it is still `pending`.
    ///
    /// A retried request with the same dedup key returns the existing task
    /// and only dispatches it if an earlier dispatch never succeeded. A retry
    /// that overlaps an in-flight dispatch waits for it and returns its
    /// outcome instead of calling a worker again.
    pub async fn submit(
        &self,
        user_id: &str,
        request: CreateTaskRequest,
    ) -> Result<TaskRecord, TaskError> {
        let task = self.create(user_id, request).await?;
        if task.status != TaskStatus::Pending {
            return Ok(task);
        }

        let claim = self.claim_dispatch(task.id).await;
        let result = match self.load(task.id).await {
            Ok(task) if task.status == TaskStatus::Pending => self.dispatch_claimed(task).await,
            other => other,
        };
        self.release_dispatch(task.id, claim).await;
        result
    }

    /// Wait for exclusive dispatch rights on `task_id`.
    async fn claim_dispatch(&self, task_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut claims = self.dispatch_claims.lock().await;
            Arc::clone(claims.entry(task_id).or_default())
        };
        lock.lock_owned().await
    }

    async fn release_dispatch(&self, task_id: Uuid, claim: OwnedMutexGuard<()>) {
        drop(claim);
        let mut claims = self.dispatch_claims.lock().await;
        if claims
            .get(&task_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            claims.remove(&task_id);
        }
    }

    /// Select a worker, send the task and record the assignment. The
    /// caller holds the task's dispatch claim and has seen it `pending`.
    async fn dispatch_claimed(&self, task: TaskRecord) -> Result<TaskRecord, TaskError> {
        let task_id = task.id;
        let active = self.store.count_active_by_worker().await?;
        let worker = self
            .registry
            .select(&task.worker_type, &active)
            .map_err(|source| TaskError::Dispatch {
                id: task_id,
                source,
            })?;

        let request = DispatchRequest::for_task(
            &task,
            &worker.name,
            self.webhook_url(task_id),
            self.task_secret(task_id),
        );
        let timeout = self.config.worker_call_timeout;
        let accepted = match tokio::time::timeout(timeout, self.client.dispatch(worker, &request))
            .await
        {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(source)) => {
                warn!(task_id = %task_id, worker = %worker.name, error = %source, "Dispatch failed");
                return Err(TaskError::Dispatch {
                    id: task_id,
                    source,
                });
            }
            Err(_) => {
                warn!(task_id = %task_id, worker = %worker.name, "Dispatch timed out");
                return Err(TaskError::Dispatch {
                    id: task_id,
                    source: DispatchError::Timeout {
                        worker: worker.name.clone(),
                        timeout,
                    },
                });
            }
        };

        let moved = self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Pending],
                TaskStatus::Dispatched,
                Some(&worker.name),
            )
            .await?;
        let task = self.load(task_id).await?;
        if !moved {
            return Err(TaskError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::Dispatched,
            });
        }
        info!(
            task_id = %task_id,
            worker = %worker.name,
            session_handle = ?accepted.session_handle,
            "Task dispatched"
        );
        Ok(task)
    }

    // ── Read ────────────────────────────────────────────────────────────

    async fn load(&self, task_id: Uuid) -> Result<TaskRecord, TaskError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })
    }

    /// Fetch a task on behalf of `user_id`.
    pub async fn get(&self, task_id: Uuid, user_id: &str) -> Result<TaskRecord, TaskError> {
        let task = self.load(task_id).await?;
        if !task.is_owned_by(user_id) {
            return Err(TaskError::Forbidden { id: task_id });
        }
        Ok(task)
    }

    // ── Cancel ──────────────────────────────────────────────────────────

    /// Cancel a dispatched or running task.
    ///
    /// The durable write decides the outcome. The worker is told to stop
    /// afterwards in the background; that call's result is only logged.
    pub async fn cancel(&self, task_id: Uuid, user_id: &str) -> Result<TaskRecord, TaskError> {
        let task = self.get(task_id, user_id).await?;
        if !task.status.is_active() {
            return Err(TaskError::NotRunning {
                id: task_id,
                status: task.status,
            });
        }

        let moved = self
            .store
            .transition_task(task_id, &TaskStatus::ACTIVE, TaskStatus::Cancelled, None)
            .await?;
        let current = self.load(task_id).await?;
        if !moved {
            return Err(TaskError::NotRunning {
                id: task_id,
                status: current.status,
            });
        }
        info!(task_id = %task_id, user_id = %user_id, "Task cancelled");

        self.notify_cancel(&current);
        Ok(current)
    }

    /// Fire-and-forget stop request to the task's worker.
    fn notify_cancel(&self, task: &TaskRecord) {
        let Some(location) = task.worker_location.clone() else {
            return;
        };
        let Some(worker) = self.registry.get(&location).cloned() else {
            warn!(task_id = %task.id, worker = %location, "Cancelled task's worker is not configured");
            return;
        };

        let client = Arc::clone(&self.client);
        let timeout = self.config.worker_call_timeout;
        let request = CancelRequest {
            task_id: task.id,
            worker_location: location,
        };
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, client.cancel(&worker, &request)).await {
                Ok(Ok(())) => {
                    debug!(task_id = %request.task_id, worker = %worker.name, "Worker acknowledged cancel")
                }
                Ok(Err(e)) => {
                    warn!(task_id = %request.task_id, worker = %worker.name, error = %e, "Worker cancel notification failed")
                }
                Err(_) => {
                    warn!(task_id = %request.task_id, worker = %worker.name, "Worker cancel notification timed out")
                }
            }
        });
    }

    // ── Callbacks ───────────────────────────────────────────────────────

    /// Apply a progress or completion callback from a worker. The caller
    /// has already verified its signature.
    pub async fn handle_callback(
        &self,
        task_id: Uuid,
        callback: CompletionCallback,
    ) -> Result<TaskRecord, TaskError> {
        if callback.task_id != task_id {
            return Err(TaskError::InvalidRequest(format!(
                "callback for {} posted to task {task_id}",
                callback.task_id
            )));
        }
        let task = self.load(task_id).await?;

        if task.status.is_terminal() {
            self.store.mark_callback_received(task_id).await?;
            debug!(task_id = %task_id, status = %task.status, "Callback for finished task recorded");
            return self.load(task_id).await;
        }

        let to = TaskStatus::from(callback.status);
        if callback.status == CallbackStatus::Running {
            let moved = self
                .store
                .transition_task(task_id, &TaskStatus::ACTIVE, TaskStatus::Running, None)
                .await?;
            if !moved {
                debug!(task_id = %task_id, status = %task.status, "Progress callback before dispatch was recorded");
            }
            return self.load(task_id).await;
        }

        let result = merge_result(callback.result, callback.error);
        let finalized = self
            .store
            .finalize_task(task_id, &TaskStatus::ACTIVE, to, result.as_ref())
            .await?;
        let current = self.load(task_id).await?;
        if finalized {
            info!(task_id = %task_id, status = %to, "Task finished");
            return Ok(current);
        }

        if current.status.is_terminal() {
            // Cancelled or interrupted concurrently.
            self.store.mark_callback_received(task_id).await?;
            return self.load(task_id).await;
        }
        Err(TaskError::InvalidTransition {
            id: task_id,
            from: current.status,
            to,
        })
    }

    // ── Logs ────────────────────────────────────────────────────────────

    /// Store a shipped log chunk. Returns `false` for a duplicate.
    pub async fn ingest_log_chunk(&self, chunk: &LogChunk) -> Result<bool, TaskError> {
        self.load(chunk.task_id).await?;
        let stored = self.store.append_log_chunk(chunk).await?;
        if !stored {
            debug!(task_id = %chunk.task_id, sequence = chunk.sequence, "Duplicate log chunk ignored");
        }
        Ok(stored)
    }
}

/// Fold a callback's error message into its result payload.
fn merge_result(
    result: Option<serde_json::Value>,
    error: Option<String>,
) -> Option<serde_json::Value> {
    match (result, error) {
        (Some(mut value), Some(error)) => {
            match value.as_object_mut() {
                Some(obj) => {
                    obj.insert("error".into(), serde_json::Value::String(error));
                }
                None => value = serde_json::json!({ "value": value, "error": error }),
            }
            Some(value)
        }
        (None, Some(error)) => Some(serde_json::json!({ "error": error })),
        (result, None) => result,
    }
}
