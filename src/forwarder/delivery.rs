//! Retry-with-backoff-then-drop delivery of a single chunk.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::sink::LogSink;
use crate::protocol::LogChunk;

/// Result of one delivery step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStep {
    Delivered,
    /// Failed, attempts remain; wait this long before the next step.
    RetryAfter(Duration),
    /// All attempts exhausted.
    Dropped,
}

/// Final outcome for a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Dropped { attempts: u32, last_error: String },
}

/// A chunk waiting to be acknowledged by the sink.
#[derive(Debug)]
pub struct PendingChunk {
    pub chunk: LogChunk,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PendingChunk {
    pub fn new(chunk: LogChunk) -> Self {
        Self {
            chunk,
            attempts: 0,
            last_error: None,
        }
    }

    /// Make one delivery attempt and decide what happens next.
    pub async fn step(
        &mut self,
        sink: &dyn LogSink,
        max_attempts: u32,
        base_delay: Duration,
    ) -> DeliveryStep {
        self.attempts += 1;
        match sink.append(&self.chunk).await {
            Ok(()) => DeliveryStep::Delivered,
            Err(e) => {
                debug!(
                    task_id = %self.chunk.task_id,
                    sequence = self.chunk.sequence,
                    attempt = self.attempts,
                    error = %e,
                    "Chunk upload failed"
                );
                self.last_error = Some(e.to_string());
                if self.attempts >= max_attempts {
                    DeliveryStep::Dropped
                } else {
                    DeliveryStep::RetryAfter(backoff(base_delay, self.attempts))
                }
            }
        }
    }
}

/// Exponential backoff with up to 50% jitter: `base * 2^(attempt-1)`.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let jitter_ms = (exp.as_millis() as u64) / 2;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    exp + jitter
}

/// Drive a chunk to `Delivered` or `Dropped`, sleeping between attempts.
pub async fn deliver(
    sink: &dyn LogSink,
    chunk: LogChunk,
    max_attempts: u32,
    base_delay: Duration,
) -> DeliveryOutcome {
    let mut pending = PendingChunk::new(chunk);
    loop {
        match pending.step(sink, max_attempts.max(1), base_delay).await {
            DeliveryStep::Delivered => return DeliveryOutcome::Delivered,
            DeliveryStep::RetryAfter(delay) => tokio::time::sleep(delay).await,
            DeliveryStep::Dropped => {
                let last_error = pending.last_error.take().unwrap_or_default();
                warn!(
                    task_id = %pending.chunk.task_id,
                    sequence = pending.chunk.sequence,
                    attempts = pending.attempts,
                    error = %last_error,
                    "Dropping log chunk after exhausting retries"
                );
                return DeliveryOutcome::Dropped {
                    attempts: pending.attempts,
                    last_error,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::error::LogSinkError;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LogSink for FlakySink {
        async fn append(&self, _chunk: &LogChunk) -> Result<(), LogSinkError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(LogSinkError::Upload("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    fn chunk() -> LogChunk {
        LogChunk {
            task_id: Uuid::new_v4(),
            sequence: 0,
            content: "x".into(),
        }
    }

    #[tokio::test]
    async fn delivers_after_transient_failures() {
        let sink = FlakySink {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let outcome = deliver(&sink, chunk(), 3, Duration::from_millis(1)).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn drops_after_three_attempts() {
        let sink = FlakySink {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let outcome = deliver(&sink, chunk(), 3, Duration::from_millis(1)).await;
        match outcome {
            DeliveryOutcome::Dropped {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("connection reset"));
            }
            other => panic!("expected drop, got {other:?}"),
        }
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn step_reports_retry_then_drop() {
        let sink = FlakySink {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let mut pending = PendingChunk::new(chunk());
        let base = Duration::from_millis(10);
        assert!(matches!(
            pending.step(&sink, 2, base).await,
            DeliveryStep::RetryAfter(_)
        ));
        assert_eq!(pending.step(&sink, 2, base).await, DeliveryStep::Dropped);
        assert_eq!(pending.attempts, 2);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let base = Duration::from_millis(100);
        let first = backoff(base, 1);
        let third = backoff(base, 3);
        assert!(first >= base && first <= base * 3 / 2);
        assert!(third >= base * 4 && third <= base * 6);
    }
}
