//! Error types for task-relay.

use std::time::Duration;

use uuid::Uuid;

use crate::task::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Worker state error: {0}")]
    State(#[from] StateError),

    #[error("Log sink error: {0}")]
    LogSink(#[from] LogSinkError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable metadata store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },
}

/// Errors from single-task operations on the coordinator.
///
/// The first four variants are caller errors; the rest are downstream
/// failures surfaced as internal errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} does not belong to the caller")]
    Forbidden { id: Uuid },

    #[error("Task {id} is {status}, not running")]
    NotRunning { id: Uuid, status: TaskStatus },

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Dispatch failed for task {id}: {source}")]
    Dispatch {
        id: Uuid,
        #[source]
        source: DispatchError,
    },

    #[error("Internal error: {0}")]
    Internal(#[from] DatabaseError),
}

/// Coordinator → worker call failures.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No workers configured")]
    NoWorkers,

    #[error("Unknown worker {0}")]
    UnknownWorker(String),

    #[error("Worker {worker} timed out after {timeout:?}")]
    Timeout { worker: String, timeout: Duration },

    #[error("Worker {worker} unreachable: {reason}")]
    Unreachable { worker: String, reason: String },

    #[error("Worker {worker} rejected request with status {status}: {body}")]
    Rejected {
        worker: String,
        status: u16,
        body: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Signature verification failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing signature header")]
    Missing,

    #[error("Malformed signature header")]
    Malformed,

    #[error("Signature timestamp outside the accepted window")]
    Expired,

    #[error("Signature mismatch")]
    Mismatch,
}

/// Worker State Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize worker state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("State file {path} is valid JSON but has an unexpected shape: {reason}")]
    UnexpectedShape { path: String, reason: String },
}

/// Log-chunk delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Log store rejected chunk with status {0}")]
    Rejected(u16),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Worker-side task handling errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Task {id} not tracked by this worker")]
    UnknownTask { id: Uuid },

    #[error("Task {id} is still active and cannot be reaped")]
    StillActive { id: Uuid },

    #[error("Working tree setup failed: {0}")]
    WorkingTree(String),

    #[error("Agent launch failed: {0}")]
    Launch(String),

    #[error("Credential refresh failed: {0}")]
    Credential(String),

    #[error("Callback delivery failed: {0}")]
    Callback(String),

    #[error("Coordinator rejected callback with status {status}: {body}")]
    CallbackRejected { status: u16, body: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
