//! Signed callbacks from the worker to the coordinator.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::protocol::{CompletionCallback, SignedBody};

/// Delivers progress and completion callbacks.
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    /// Post `callback` to `url`, signed with the per-task `secret`.
    async fn send(
        &self,
        url: &str,
        secret: &str,
        callback: &CompletionCallback,
    ) -> Result<(), WorkerError>;
}

/// Whether a failed delivery can never succeed by sending it again.
///
/// 4xx answers are final except conflicts (the coordinator has not recorded
/// the dispatch yet), request timeouts and rate limiting.
pub fn is_permanent_rejection(error: &WorkerError) -> bool {
    matches!(
        error,
        WorkerError::CallbackRejected { status, .. }
            if (400..500).contains(status) && !matches!(*status, 408 | 409 | 429)
    )
}

/// [`CallbackNotifier`] over HTTP.
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(timeout: Duration) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Callback(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackNotifier for HttpNotifier {
    async fn send(
        &self,
        url: &str,
        secret: &str,
        callback: &CompletionCallback,
    ) -> Result<(), WorkerError> {
        let signed = SignedBody::new(secret.as_bytes(), callback)
            .map_err(|e| WorkerError::Callback(e.to_string()))?;
        let response = signed
            .apply(self.client.post(url))
            .send()
            .await
            .map_err(|e| WorkerError::Callback(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(WorkerError::CallbackRejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}
