//! Short-lived upstream credential shared by every task on this worker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WorkerError;

/// A cached token is only reused while it has at least this long left.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// A token and its expiry, persisted in the worker state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialCache {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl CredentialCache {
    /// Whether the token is still usable at `now` with [`REFRESH_MARGIN`] to spare.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::seconds(REFRESH_MARGIN.as_secs() as i64);
        self.expires_at - margin > now
    }
}

/// Source of fresh credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch(&self) -> Result<CredentialCache, WorkerError>;
}

/// Runs a command that prints a token on stdout; the token is assumed
/// valid for `ttl` from the moment it is fetched.
pub struct CommandCredentialProvider {
    command: Vec<String>,
    ttl: Duration,
}

impl CommandCredentialProvider {
    pub fn new(command: Vec<String>, ttl: Duration) -> Self {
        Self { command, ttl }
    }
}

#[async_trait]
impl CredentialProvider for CommandCredentialProvider {
    async fn fetch(&self) -> Result<CredentialCache, WorkerError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| WorkerError::Credential("empty credential command".into()))?;

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| WorkerError::Credential(format!("failed to run {program}: {e}")))?;
        if !output.status.success() {
            return Err(WorkerError::Credential(format!(
                "{program} exited with {}",
                output.status
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(WorkerError::Credential(format!("{program} printed no token")));
        }
        let ttl = chrono::Duration::seconds(self.ttl.as_secs() as i64);
        debug!(program = %program, "Fetched fresh upstream credential");
        Ok(CredentialCache {
            token,
            expires_at: Utc::now() + ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_honours_margin() {
        let now = Utc::now();
        let cache = |secs: i64| CredentialCache {
            token: "t".into(),
            expires_at: now + chrono::Duration::seconds(secs),
        };
        assert!(cache(3600).is_fresh(now));
        assert!(cache(61).is_fresh(now));
        assert!(!cache(60).is_fresh(now));
        assert!(!cache(30).is_fresh(now));
        assert!(!cache(-5).is_fresh(now));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let provider = CommandCredentialProvider::new(Vec::new(), Duration::from_secs(60));
        assert!(matches!(
            provider.fetch().await,
            Err(WorkerError::Credential(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_output_becomes_token() {
        let provider = CommandCredentialProvider::new(
            vec!["echo".into(), "abc123".into()],
            Duration::from_secs(3600),
        );
        let cache = provider.fetch().await.unwrap();
        assert_eq!(cache.token, "abc123");
        assert!(cache.is_fresh(Utc::now()));
    }
}
