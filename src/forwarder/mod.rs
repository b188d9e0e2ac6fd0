//! Log Forwarder: ships each active task's log file to central storage.
//!
//! Core components:
//! - `chunker`: splits buffered output into bounded chunks
//! - `delivery`: per-chunk retry-with-backoff state machine
//! - `session`: per-task read offset, buffer, ceilings and stats
//! - `watcher`: session registry with polling watch loops
//! - `sink`: `LogSink` trait and the HTTP sink to the coordinator

pub mod chunker;
pub mod delivery;
pub mod session;
pub mod sink;
pub mod watcher;

pub use session::ForwardingStats;
pub use sink::{HttpLogSink, LogSink};
pub use watcher::LogForwarder;
