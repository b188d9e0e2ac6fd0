//! The worker process: accepts dispatched tasks, runs the agent, mirrors its
//! progress into the state file and reports back to the coordinator.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::credentials::CredentialProvider;
use super::launcher::{AgentExit, AgentLauncher, AgentSession, CREDENTIAL_ENV, LaunchSpec};
use super::notifier::{CallbackNotifier, is_permanent_rejection};
use super::state::{LocalStatus, PendingNotification, StateFile, WorkerState, WorkerTaskEntry};
use super::worktree::{WorkingTrees, find_orphans};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::forwarder::{LogForwarder, LogSink};
use crate::protocol::{AcceptResponse, CallbackStatus, CompletionCallback, DispatchRequest};
use crate::task::validate_repository;

/// Collaborators the runtime is built from.
pub struct WorkerDeps {
    pub config: WorkerConfig,
    pub launcher: Arc<dyn AgentLauncher>,
    pub trees: Arc<dyn WorkingTrees>,
    pub notifier: Arc<dyn CallbackNotifier>,
    pub log_sink: Arc<dyn LogSink>,
    pub credentials: Option<Arc<dyn CredentialProvider>>,
}

/// One edge worker.
///
/// The state mutex is held across every save, so the state file only ever
/// has one writer.
pub struct WorkerRuntime {
    config: WorkerConfig,
    launcher: Arc<dyn AgentLauncher>,
    trees: Arc<dyn WorkingTrees>,
    notifier: Arc<dyn CallbackNotifier>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    state_file: StateFile,
    state: Mutex<WorkerState>,
    forwarder: LogForwarder,
}

impl WorkerRuntime {
    /// Load persisted state, fail over tasks the previous process left
    /// active, and replay unconfirmed callbacks.
    pub async fn start(deps: WorkerDeps) -> Result<Arc<Self>, WorkerError> {
        let state_file = StateFile::new(&deps.config.state_path);
        let state = state_file.load().await?;
        info!(
            location = %deps.config.location,
            tasks = state.tasks.len(),
            pending_notifications = state.pending_notifications.len(),
            "Worker state loaded"
        );

        let forwarder = LogForwarder::new(deps.config.forwarder.clone(), deps.log_sink);
        let runtime = Arc::new(Self {
            config: deps.config,
            launcher: deps.launcher,
            trees: deps.trees,
            notifier: deps.notifier,
            credentials: deps.credentials,
            state_file,
            state: Mutex::new(state),
            forwarder,
        });

        runtime.recover_interrupted().await?;
        runtime.replay_pending().await;
        runtime.log_orphans().await;
        Ok(runtime)
    }

    pub fn location(&self) -> &str {
        &self.config.location
    }

    // ── Accept ──────────────────────────────────────────────────────────

    /// Accept a dispatched task: record it, create its working tree, launch
    /// the agent and start forwarding its log.
    ///
    /// Accepting an already tracked task id returns its current status
    /// without starting anything. On failure the entry is discarded, so a
    /// retried dispatch starts clean.
    pub async fn accept(
        self: &Arc<Self>,
        request: DispatchRequest,
    ) -> Result<AcceptResponse, WorkerError> {
        let task_id = request.task_id;
        validate_repository(&request.repository).map_err(WorkerError::InvalidRequest)?;
        let entry = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.tasks.get(&task_id) {
                info!(task_id = %task_id, status = existing.status.as_str(), "Task already accepted");
                return Ok(AcceptResponse {
                    task_id,
                    status: existing.status.as_str().to_string(),
                    session_handle: existing.session_handle.clone(),
                });
            }

            let mut entry = WorkerTaskEntry::queued(&request);
            entry.working_tree_path = Some(self.config.worktrees_dir.join(task_id.to_string()));
            entry.log_path = Some(self.config.logs_dir.join(format!("{task_id}.log")));
            state.tasks.insert(task_id, entry.clone());
            self.state_file.save(&state).await?;
            entry
        };
        info!(
            task_id = %task_id,
            trace_id = %entry.trace_id,
            repository = %entry.repository,
            "Task accepted"
        );

        let AgentSession { handle, exit } = match self.launch(&entry).await {
            Ok(session) => session,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to start task");
                self.discard(task_id).await;
                return Err(e);
            }
        };

        let status = {
            let mut state = self.state.lock().await;
            match state.tasks.get_mut(&task_id) {
                Some(entry) if entry.status == LocalStatus::Queued => {
                    entry.status = LocalStatus::Running;
                    entry.session_handle = Some(handle.clone());
                    entry.started_at = Some(Utc::now());
                    if let Err(e) = self.state_file.save(&state).await {
                        error!(task_id = %task_id, error = %e, "Failed to persist running task");
                    }
                    LocalStatus::Running
                }
                other => {
                    // Cancelled while the agent was starting.
                    let status = other.map(|e| e.status).unwrap_or(LocalStatus::Cancelled);
                    if let Err(e) = self.launcher.stop(&handle).await {
                        warn!(task_id = %task_id, error = %e, "Failed to stop agent");
                    }
                    status
                }
            }
        };

        if let Some(log_path) = entry.log_path.clone() {
            self.forwarder.start_forwarding(task_id, log_path).await;
        }

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let exit = exit.await.unwrap_or(AgentExit {
                success: false,
                code: None,
                killed: false,
            });
            runtime.on_agent_exit(task_id, exit).await;
        });

        if status == LocalStatus::Running {
            let runtime = Arc::clone(self);
            tokio::spawn(async move { runtime.send_progress(task_id).await });
        }

        Ok(AcceptResponse {
            task_id,
            status: status.as_str().to_string(),
            session_handle: Some(handle),
        })
    }

    /// Checkout of `repository` under the repository root.
    fn repo_path(&self, repository: &str) -> Result<PathBuf, WorkerError> {
        validate_repository(repository).map_err(WorkerError::InvalidRequest)?;
        Ok(self.config.repos_root.join(repository))
    }

    async fn launch(&self, entry: &WorkerTaskEntry) -> Result<AgentSession, WorkerError> {
        let repo = self.repo_path(&entry.repository)?;
        let tree = entry
            .working_tree_path
            .clone()
            .ok_or_else(|| WorkerError::WorkingTree("no working tree path".into()))?;
        let log_path = entry
            .log_path
            .clone()
            .ok_or_else(|| WorkerError::Launch("no log path".into()))?;

        let branch = format!("relay/{}", entry.task_id);
        self.trees
            .create(&repo, &tree, &branch, &entry.base_branch)
            .await?;

        let launched: Result<AgentSession, WorkerError> = async {
            let mut env = Vec::new();
            if let Some(provider) = &self.credentials {
                let token = self.credential(provider.as_ref()).await?;
                env.push((CREDENTIAL_ENV.to_string(), token.expose_secret().to_string()));
            }
            self.launcher
                .launch(LaunchSpec {
                    task_id: entry.task_id,
                    prompt: entry.prompt.clone(),
                    working_dir: tree.clone(),
                    log_path,
                    env,
                })
                .await
        }
        .await;

        if launched.is_err() {
            if let Err(e) = self.trees.remove(&repo, &tree).await {
                warn!(task_id = %entry.task_id, error = %e, "Failed to remove working tree");
            }
        }
        launched
    }

    async fn discard(&self, task_id: Uuid) {
        let mut state = self.state.lock().await;
        if state.tasks.remove(&task_id).is_some() {
            if let Err(e) = self.state_file.save(&state).await {
                error!(task_id = %task_id, error = %e, "Failed to persist discarded task");
            }
        }
    }

    // ── Agent exit ──────────────────────────────────────────────────────

    async fn on_agent_exit(&self, task_id: Uuid, exit: AgentExit) {
        let stats = if self.forwarder.is_forwarding(task_id).await {
            self.forwarder.stop_forwarding(task_id).await
        } else {
            None
        };

        let notification = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.tasks.get_mut(&task_id) else {
                warn!(task_id = %task_id, "Agent exited for untracked task");
                return;
            };

            let status = match entry.status {
                LocalStatus::Cancelled => CallbackStatus::Cancelled,
                _ if exit.success => CallbackStatus::Completed,
                _ => CallbackStatus::Failed,
            };
            entry.status = match status {
                CallbackStatus::Completed => LocalStatus::Completed,
                CallbackStatus::Cancelled => LocalStatus::Cancelled,
                _ => LocalStatus::Failed,
            };
            info!(task_id = %task_id, status = entry.status.as_str(), code = ?exit.code, "Task finished");

            let callback = CompletionCallback {
                task_id,
                status,
                result: Some(serde_json::json!({
                    "exitCode": exit.code,
                    "sessionHandle": entry.session_handle,
                    "workerLocation": self.config.location,
                    "logs": stats,
                })),
                error: (status == CallbackStatus::Failed)
                    .then(|| match exit.code {
                        Some(code) => format!("agent exited with status {code}"),
                        None => "agent terminated abnormally".to_string(),
                    }),
            };
            let notification = PendingNotification::for_entry(entry, callback);
            state.pending_notifications.push(notification.clone());
            if let Err(e) = self.state_file.save(&state).await {
                error!(task_id = %task_id, error = %e, "Failed to persist finished task");
            }
            notification
        };

        self.deliver(notification).await;
    }

    // ── Cancel / reap / list ────────────────────────────────────────────

    /// Mark a task cancelled and stop its agent. Log forwarding ends once
    /// the agent has exited. Cancelling a finished task returns it unchanged.
    pub async fn cancel(&self, task_id: Uuid) -> Result<WorkerTaskEntry, WorkerError> {
        let entry = {
            let mut state = self.state.lock().await;
            let entry = state
                .tasks
                .get_mut(&task_id)
                .ok_or(WorkerError::UnknownTask { id: task_id })?;
            if entry.status.is_terminal() {
                debug!(task_id = %task_id, status = entry.status.as_str(), "Cancel for finished task");
                return Ok(entry.clone());
            }
            entry.status = LocalStatus::Cancelled;
            let snapshot = entry.clone();
            self.state_file.save(&state).await?;
            snapshot
        };
        info!(task_id = %task_id, "Task cancelled");

        if let Some(handle) = &entry.session_handle {
            match self.launcher.stop(handle).await {
                Ok(true) => {}
                Ok(false) => debug!(task_id = %task_id, "Agent already stopped"),
                Err(e) => warn!(task_id = %task_id, error = %e, "Failed to stop agent"),
            }
        }
        Ok(entry)
    }

    /// Forget a finished task and remove its working tree.
    pub async fn reap(&self, task_id: Uuid) -> Result<WorkerTaskEntry, WorkerError> {
        let entry = {
            let state = self.state.lock().await;
            let entry = state
                .tasks
                .get(&task_id)
                .ok_or(WorkerError::UnknownTask { id: task_id })?;
            if !entry.status.is_terminal() {
                return Err(WorkerError::StillActive { id: task_id });
            }
            entry.clone()
        };

        if let Some(tree) = &entry.working_tree_path {
            let removed = match self.repo_path(&entry.repository) {
                Ok(repo) => self.trees.remove(&repo, tree).await,
                Err(e) => Err(e),
            };
            if let Err(e) = removed {
                warn!(task_id = %task_id, error = %e, "Failed to remove working tree");
            }
        }

        let mut state = self.state.lock().await;
        state.tasks.remove(&task_id);
        self.state_file.save(&state).await?;
        info!(task_id = %task_id, "Task reaped");
        Ok(entry)
    }

    /// Tracked entries, oldest first.
    pub async fn list(&self) -> Vec<WorkerTaskEntry> {
        let mut entries: Vec<WorkerTaskEntry> =
            self.state.lock().await.tasks.values().cloned().collect();
        entries.sort_by_key(|e| (e.started_at, e.task_id));
        entries
    }

    pub async fn snapshot(&self) -> WorkerState {
        self.state.lock().await.clone()
    }

    /// Working trees of `repository` that no tracked task owns.
    pub async fn orphan_worktrees(&self, repository: &str) -> Result<Vec<PathBuf>, WorkerError> {
        let repo = self.repo_path(repository)?;
        let tracked: Vec<PathBuf> = self
            .state
            .lock()
            .await
            .tracked_working_trees()
            .map(PathBuf::from)
            .collect();
        Ok(find_orphans(self.trees.as_ref(), &repo, tracked.iter().map(PathBuf::as_path)).await)
    }

    async fn log_orphans(&self) {
        let repositories: BTreeSet<String> = self
            .state
            .lock()
            .await
            .tasks
            .values()
            .map(|e| e.repository.clone())
            .collect();
        for repository in repositories {
            match self.orphan_worktrees(&repository).await {
                Ok(orphans) => {
                    for orphan in orphans {
                        info!(repository = %repository, path = %orphan.display(), "Orphan working tree");
                    }
                }
                Err(e) => warn!(repository = %repository, error = %e, "Skipping orphan scan"),
            }
        }
    }

    // ── Credentials ─────────────────────────────────────────────────────

    /// The shared upstream credential, refreshed when close to expiry.
    ///
    /// The state lock is not held while the provider runs, and a provider
    /// that outlasts `credential_timeout` fails the refresh.
    pub async fn credential(
        &self,
        provider: &dyn CredentialProvider,
    ) -> Result<SecretString, WorkerError> {
        if let Some(cache) = &self.state.lock().await.credential_cache {
            if cache.is_fresh(Utc::now()) {
                return Ok(SecretString::from(cache.token.clone()));
            }
        }

        let timeout = self.config.credential_timeout;
        let fresh = tokio::time::timeout(timeout, provider.fetch())
            .await
            .map_err(|_| {
                WorkerError::Credential(format!("credential refresh timed out after {timeout:?}"))
            })??;
        debug!(expires_at = %fresh.expires_at, "Refreshed upstream credential");
        let token = SecretString::from(fresh.token.clone());

        let mut state = self.state.lock().await;
        let newer_cached = state
            .credential_cache
            .as_ref()
            .is_some_and(|cache| cache.expires_at > fresh.expires_at);
        if !newer_cached {
            state.credential_cache = Some(fresh);
            self.state_file.save(&state).await?;
        }
        Ok(token)
    }

    // ── Callbacks ───────────────────────────────────────────────────────

    /// Send a `running` progress callback for an active task.
    async fn send_progress(&self, task_id: Uuid) {
        let entry = match self.state.lock().await.tasks.get(&task_id) {
            Some(entry) if entry.status == LocalStatus::Running => entry.clone(),
            _ => return,
        };
        let callback = CompletionCallback {
            task_id,
            status: CallbackStatus::Running,
            result: None,
            error: None,
        };
        if let Err(e) = self
            .notifier
            .send(&entry.webhook_url, &entry.webhook_secret, &callback)
            .await
        {
            debug!(task_id = %task_id, error = %e, "Progress callback failed");
        }
    }

    /// Try to deliver one persisted notification.
    ///
    /// It leaves the queue once delivered, once the coordinator rejects it
    /// for good, or after `max_callback_attempts` failures.
    async fn deliver(&self, notification: PendingNotification) -> bool {
        let task_id = notification.callback.task_id;
        let sent = self
            .notifier
            .send(
                &notification.webhook_url,
                &notification.webhook_secret,
                &notification.callback,
            )
            .await;

        let mut state = self.state.lock().await;
        let delivered = match sent {
            Ok(()) => {
                state
                    .pending_notifications
                    .retain(|n| n.id != notification.id);
                debug!(task_id = %task_id, "Callback delivered");
                true
            }
            Err(e) => {
                let attempts = match state
                    .pending_notifications
                    .iter_mut()
                    .find(|n| n.id == notification.id)
                {
                    Some(pending) => {
                        pending.attempts += 1;
                        pending.attempts
                    }
                    None => notification.attempts + 1,
                };
                if is_permanent_rejection(&e) || attempts >= self.config.max_callback_attempts {
                    state
                        .pending_notifications
                        .retain(|n| n.id != notification.id);
                    error!(
                        task_id = %task_id,
                        status = ?notification.callback.status,
                        attempts,
                        error = %e,
                        "Callback dropped"
                    );
                } else {
                    warn!(task_id = %task_id, attempts, error = %e, "Callback delivery failed, will replay");
                }
                false
            }
        };
        if let Err(e) = self.state_file.save(&state).await {
            error!(task_id = %task_id, error = %e, "Failed to persist notification state");
        }
        delivered
    }

    /// Re-send every unconfirmed notification. Returns how many were delivered.
    pub async fn replay_pending(&self) -> usize {
        let pending = self.state.lock().await.pending_notifications.clone();
        if pending.is_empty() {
            return 0;
        }

        let total = pending.len();
        let mut delivered = 0;
        for notification in pending {
            if self.deliver(notification).await {
                delivered += 1;
            }
        }
        info!(delivered, remaining = total - delivered, "Replayed pending callbacks");
        delivered
    }

    /// Tasks the previous process left queued or running have lost their
    /// agent; report them failed.
    async fn recover_interrupted(&self) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;
        let mut notifications = Vec::new();
        for entry in state.tasks.values_mut() {
            if entry.status.is_terminal() {
                continue;
            }
            warn!(task_id = %entry.task_id, status = entry.status.as_str(), "Task lost its agent on restart");
            entry.status = LocalStatus::Failed;
            let callback = CompletionCallback {
                task_id: entry.task_id,
                status: CallbackStatus::Failed,
                result: None,
                error: Some("worker restarted while the task was active".to_string()),
            };
            notifications.push(PendingNotification::for_entry(entry, callback));
        }
        if !notifications.is_empty() {
            state.pending_notifications.extend(notifications);
            self.state_file.save(&state).await?;
        }
        Ok(())
    }

    /// Progress heartbeat for every running task, plus a replay of any
    /// callbacks still pending.
    pub async fn heartbeat(&self) {
        let running: Vec<Uuid> = self
            .state
            .lock()
            .await
            .tasks
            .values()
            .filter(|e| e.status == LocalStatus::Running)
            .map(|e| e.task_id)
            .collect();
        for task_id in running {
            self.send_progress(task_id).await;
        }
        self.replay_pending().await;
    }

    /// Stop all log forwarding, flushing what is buffered.
    pub async fn shutdown(&self) {
        self.forwarder.stop_all().await;
    }
}

/// Spawn the periodic heartbeat.
pub fn spawn_heartbeat(runtime: Arc<WorkerRuntime>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            runtime.heartbeat().await;
        }
    })
}
