//! Log-chunk sinks.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::LogSinkError;
use crate::protocol::{LogChunk, SignedBody};

/// Append-only destination for log chunks.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Store one chunk. Any error counts as a failed delivery attempt.
    async fn append(&self, chunk: &LogChunk) -> Result<(), LogSinkError>;
}

/// Ships chunks to the coordinator's `/internal/logs` endpoint, signed with
/// the shared dispatch secret.
pub struct HttpLogSink {
    client: reqwest::Client,
    url: String,
    secret: SecretString,
}

impl HttpLogSink {
    pub fn new(
        coordinator_url: &str,
        secret: SecretString,
        timeout: Duration,
    ) -> Result<Self, LogSinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LogSinkError::Upload(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}/internal/logs", coordinator_url.trim_end_matches('/')),
            secret,
        })
    }
}

#[async_trait]
impl LogSink for HttpLogSink {
    async fn append(&self, chunk: &LogChunk) -> Result<(), LogSinkError> {
        let signed = SignedBody::new(self.secret.expose_secret().as_bytes(), chunk)
            .map_err(|e| LogSinkError::Upload(e.to_string()))?;
        let response = signed
            .apply(self.client.post(&self.url))
            .send()
            .await
            .map_err(|e| LogSinkError::Upload(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(LogSinkError::Rejected(response.status().as_u16()))
        }
    }
}
