//! Zombie reconciliation: force stale active tasks to `interrupted`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lifecycle::TaskCoordinator;
use crate::error::TaskError;
use crate::task::TaskStatus;

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Stale tasks found.
    pub detected: usize,
    /// Of those, how many were moved to `interrupted`.
    pub interrupted: usize,
    /// Tasks whose update failed.
    pub errors: Vec<Uuid>,
}

impl TaskCoordinator {
    /// Interrupt every dispatched/running task whose `updated_at` is older
    /// than the stale threshold.
    ///
    /// A failed update on one task is recorded and the run continues. A
    /// failed stale-task query fails the whole run. Runs never overlap.
    pub async fn reconcile(&self) -> Result<ReconcileReport, TaskError> {
        let _guard = self.reconcile_lock.lock().await;

        let Some(cutoff) = chrono::Duration::from_std(self.config.stale_threshold)
            .ok()
            .and_then(|threshold| Utc::now().checked_sub_signed(threshold))
        else {
            return Ok(ReconcileReport::default());
        };

        let stale = self
            .store
            .list_stale_tasks(&TaskStatus::ACTIVE, cutoff)
            .await?;
        let mut report = ReconcileReport {
            detected: stale.len(),
            ..ReconcileReport::default()
        };

        for task in stale {
            match self
                .store
                .transition_if_stale(task.id, &TaskStatus::ACTIVE, TaskStatus::Interrupted, cutoff)
                .await
            {
                Ok(true) => {
                    report.interrupted += 1;
                    info!(
                        task_id = %task.id,
                        status = %task.status,
                        worker = ?task.worker_location,
                        last_update = %task.updated_at,
                        "Zombie task interrupted"
                    );
                }
                Ok(false) => {
                    debug!(task_id = %task.id, "Stale task was updated before it could be interrupted");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to interrupt zombie task");
                    report.errors.push(task.id);
                }
            }
        }

        if report.detected > 0 {
            info!(
                detected = report.detected,
                interrupted = report.interrupted,
                errors = report.errors.len(),
                "Reconciliation finished"
            );
        }
        Ok(report)
    }
}

/// Spawn the periodic reconciliation loop.
pub fn spawn_reconciler(coordinator: Arc<TaskCoordinator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = coordinator.reconcile().await {
                warn!(error = %e, "Reconciliation run failed");
            }
        }
    })
}
