//! Per-task forwarding state: read offset, buffer, ceilings and counters.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};
use uuid::Uuid;

use super::chunker::{next_cut, truncate_to_boundary};
use super::delivery::{DeliveryOutcome, deliver};
use super::sink::LogSink;
use crate::config::ForwarderConfig;
use crate::protocol::LogChunk;

/// Counters for one task's forwarding session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForwardingStats {
    pub chunks_sent: u64,
    pub chunks_dropped: u64,
    pub bytes_sent: u64,
    /// Next sequence number; also the number of chunks emitted.
    pub next_sequence: u64,
    /// Set once a per-task ceiling was hit; later output is not shipped.
    pub capped: bool,
}

/// Forwarding state for one task. Driven by a single watch loop, so no
/// two flushes for the same task ever run at once.
pub struct TaskLogSession {
    task_id: Uuid,
    log_path: PathBuf,
    config: Arc<ForwarderConfig>,
    /// Bytes of the file already consumed.
    offset: u64,
    /// Trailing bytes of an incomplete UTF-8 sequence from the last read.
    carry: Vec<u8>,
    buffer: String,
    bytes_emitted: u64,
    last_flush: Instant,
    stats: ForwardingStats,
}

impl TaskLogSession {
    pub fn new(task_id: Uuid, log_path: PathBuf, config: Arc<ForwarderConfig>) -> Self {
        Self {
            task_id,
            log_path,
            config,
            offset: 0,
            carry: Vec::new(),
            buffer: String::new(),
            bytes_emitted: 0,
            last_flush: Instant::now(),
            stats: ForwardingStats::default(),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn stats(&self) -> &ForwardingStats {
        &self.stats
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Read what was appended to the log since the last read.
    ///
    /// A missing file reads as empty. A file shorter than the stored offset
    /// was truncated or rotated, and is read again from the start. Each read
    /// stops once the buffer holds what the byte ceiling could still ship
    /// plus one chunk, and a capped session only moves its offset forward.
    pub async fn read_new(&mut self) -> std::io::Result<usize> {
        let mut file = match tokio::fs::File::open(&self.log_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        if len < self.offset {
            info!(
                task_id = %self.task_id,
                offset = self.offset,
                len,
                "Log file shrank, reading from start"
            );
            self.offset = 0;
            self.carry.clear();
        }
        if len == self.offset {
            return Ok(0);
        }
        if self.stats.capped {
            self.offset = len;
            return Ok(0);
        }

        let limit = self.read_budget().min(len - self.offset);
        if limit == 0 {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut bytes = Vec::with_capacity(limit as usize);
        let read = (&mut file).take(limit).read_to_end(&mut bytes).await?;
        self.offset += read as u64;
        self.ingest(&bytes);
        Ok(read)
    }

    /// Bytes worth buffering before the next flush.
    fn read_budget(&self) -> u64 {
        let shippable = self
            .config
            .max_bytes_per_task
            .saturating_sub(self.bytes_emitted)
            .saturating_add(self.config.max_chunk_bytes as u64);
        shippable.saturating_sub((self.buffer.len() + self.carry.len()) as u64)
    }

    /// Append raw bytes to the buffer, holding back an incomplete trailing
    /// UTF-8 sequence until the rest of it arrives.
    pub fn ingest(&mut self, bytes: &[u8]) {
        if self.stats.capped {
            return;
        }
        self.carry.extend_from_slice(bytes);
        let pending = std::mem::take(&mut self.carry);

        match std::str::from_utf8(&pending) {
            Ok(text) => self.buffer.push_str(text),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.buffer
                    .push_str(&String::from_utf8_lossy(&pending[..valid]));
                self.carry = pending[valid..].to_vec();
            }
            Err(_) => self.buffer.push_str(&String::from_utf8_lossy(&pending)),
        }
    }

    /// Size trigger reached, or the flush interval elapsed with data buffered.
    pub fn should_flush(&self, now: Instant) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        self.buffer.len() >= self.config.max_chunk_bytes
            || now.duration_since(self.last_flush) >= self.config.flush_interval
    }

    fn ceiling_reached(&self) -> bool {
        self.stats.next_sequence >= self.config.max_chunks_per_task
            || self.bytes_emitted >= self.config.max_bytes_per_task
    }

    /// Ship the whole buffer as one or more chunks.
    ///
    /// Failed chunks are dropped after the configured attempts and counted;
    /// their sequence numbers stay consumed.
    pub async fn flush(&mut self, sink: &dyn LogSink) {
        self.last_flush = Instant::now();
        let max = self.config.max_chunk_bytes;

        while !self.buffer.is_empty() {
            if self.ceiling_reached() {
                self.cap();
                return;
            }

            let cut = next_cut(&self.buffer, max, self.config.newline_window);
            let remaining_budget =
                self.config.max_bytes_per_task.saturating_sub(self.bytes_emitted) as usize;
            let content = truncate_to_boundary(&self.buffer[..cut], remaining_budget).to_string();
            if content.is_empty() {
                self.cap();
                return;
            }
            self.buffer.drain(..content.len());

            let sequence = self.stats.next_sequence;
            self.stats.next_sequence += 1;
            self.bytes_emitted += content.len() as u64;
            let len = content.len() as u64;

            let chunk = LogChunk {
                task_id: self.task_id,
                sequence,
                content,
            };
            match deliver(
                sink,
                chunk,
                self.config.max_attempts,
                self.config.retry_base_delay,
            )
            .await
            {
                DeliveryOutcome::Delivered => {
                    self.stats.chunks_sent += 1;
                    self.stats.bytes_sent += len;
                    debug!(task_id = %self.task_id, sequence, bytes = len, "Chunk delivered");
                }
                DeliveryOutcome::Dropped { .. } => {
                    self.stats.chunks_dropped += 1;
                }
            }
        }

        if self.ceiling_reached() {
            self.cap();
        }
    }

    fn cap(&mut self) {
        if !self.stats.capped {
            info!(
                task_id = %self.task_id,
                chunks = self.stats.next_sequence,
                bytes = self.bytes_emitted,
                "Log forwarding ceiling reached, further output not shipped"
            );
        }
        self.stats.capped = true;
        self.buffer = String::new();
        self.carry = Vec::new();
    }
}
