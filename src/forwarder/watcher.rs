//! Session registry and per-task watch loops.
//!
//! Each active task gets one spawned loop that polls its log file on a
//! fixed interval. Reads, flushes and retries for a task all happen inside
//! that loop, so a new tick never starts while a flush is still awaited.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::session::{ForwardingStats, TaskLogSession};
use super::sink::LogSink;
use crate::config::ForwarderConfig;

/// Handle to a running watch loop.
struct ActiveSession {
    stop_tx: oneshot::Sender<()>,
    stats_rx: watch::Receiver<ForwardingStats>,
    handle: JoinHandle<ForwardingStats>,
}

/// Watches task log files and ships them to a [`LogSink`].
pub struct LogForwarder {
    config: Arc<ForwarderConfig>,
    sink: Arc<dyn LogSink>,
    sessions: Mutex<HashMap<Uuid, ActiveSession>>,
}

impl LogForwarder {
    pub fn new(config: ForwarderConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            config: Arc::new(config),
            sink,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `log_path` for `task_id`.
    ///
    /// Returns `false` (and logs a warning) if the task already has a
    /// session; the existing session is left untouched.
    pub async fn start_forwarding(&self, task_id: Uuid, log_path: PathBuf) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&task_id) {
            warn!(task_id = %task_id, "Log forwarding already active, ignoring start");
            return false;
        }

        let session = TaskLogSession::new(task_id, log_path.clone(), Arc::clone(&self.config));
        let (stop_tx, stop_rx) = oneshot::channel();
        let (stats_tx, stats_rx) = watch::channel(ForwardingStats::default());
        let handle = tokio::spawn(run_session(
            session,
            Arc::clone(&self.sink),
            Arc::clone(&self.config),
            stop_rx,
            stats_tx,
        ));

        sessions.insert(
            task_id,
            ActiveSession {
                stop_tx,
                stats_rx,
                handle,
            },
        );
        info!(task_id = %task_id, path = %log_path.display(), "Log forwarding started");
        true
    }

    /// Flush remaining output and end the session for `task_id`.
    ///
    /// Waits for the final flush (with the usual retry policy) to finish.
    /// Returns `None` (and logs a warning) if no session was active.
    pub async fn stop_forwarding(&self, task_id: Uuid) -> Option<ForwardingStats> {
        let active = self.sessions.lock().await.remove(&task_id);
        let Some(active) = active else {
            warn!(task_id = %task_id, "No active log forwarding session to stop");
            return None;
        };

        let _ = active.stop_tx.send(());
        let stats = match active.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Log forwarding loop ended abnormally");
                active.stats_rx.borrow().clone()
            }
        };
        info!(
            task_id = %task_id,
            chunks_sent = stats.chunks_sent,
            chunks_dropped = stats.chunks_dropped,
            bytes_sent = stats.bytes_sent,
            capped = stats.capped,
            "Log forwarding stopped"
        );
        Some(stats)
    }

    /// Latest counters for an active session.
    pub async fn stats(&self, task_id: Uuid) -> Option<ForwardingStats> {
        self.sessions
            .lock()
            .await
            .get(&task_id)
            .map(|s| s.stats_rx.borrow().clone())
    }

    /// Task ids with an active session.
    pub async fn active_sessions(&self) -> Vec<Uuid> {
        self.sessions.lock().await.keys().copied().collect()
    }

    pub async fn is_forwarding(&self, task_id: Uuid) -> bool {
        self.sessions.lock().await.contains_key(&task_id)
    }

    /// Stop every session, flushing each.
    pub async fn stop_all(&self) {
        let ids = self.active_sessions().await;
        join_all(ids.into_iter().map(|task_id| self.stop_forwarding(task_id))).await;
    }
}

/// The watch loop: poll, flush on size or time, and flush once more on stop.
async fn run_session(
    mut session: TaskLogSession,
    sink: Arc<dyn LogSink>,
    config: Arc<ForwarderConfig>,
    mut stop_rx: oneshot::Receiver<()>,
    stats_tx: watch::Sender<ForwardingStats>,
) -> ForwardingStats {
    let task_id = session.task_id();

    // Existing content becomes the initial buffer; only later appends are read after this.
    if let Err(e) = session.read_new().await {
        warn!(task_id = %task_id, error = %e, "Initial log read failed");
    }

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {
                if let Err(e) = session.read_new().await {
                    debug!(task_id = %task_id, error = %e, "Log poll failed");
                }
                if session.should_flush(Instant::now()) {
                    session.flush(sink.as_ref()).await;
                }
                stats_tx.send_replace(session.stats().clone());
            }
        }
    }

    if let Err(e) = session.read_new().await {
        warn!(task_id = %task_id, error = %e, "Final log read failed");
    }
    session.flush(sink.as_ref()).await;
    let stats = session.stats().clone();
    stats_tx.send_replace(stats.clone());
    stats
}
