//! Edge worker: runs dispatched tasks and keeps their state on local disk.
//!
//! Core components:
//! - `state`: the Worker State Store (load / atomic save / quarantine)
//! - `credentials`: shared short-lived upstream credential
//! - `worktree`: isolated per-task checkouts and orphan detection
//! - `launcher`: agent process start / stop
//! - `notifier`: signed callbacks to the coordinator
//! - `runtime`: accept, cancel, reap, exit handling, heartbeat
//! - `routes`: signed HTTP surface

pub mod credentials;
pub mod launcher;
pub mod notifier;
pub mod routes;
pub mod runtime;
pub mod state;
pub mod worktree;

pub use credentials::{CommandCredentialProvider, CredentialCache, CredentialProvider};
pub use launcher::{AgentLauncher, ProcessLauncher};
pub use notifier::{CallbackNotifier, HttpNotifier};
pub use routes::worker_routes;
pub use runtime::{WorkerDeps, WorkerRuntime, spawn_heartbeat};
pub use state::{LocalStatus, StateFile, WorkerState, WorkerTaskEntry};
pub use worktree::{GitWorkingTrees, WorkingTrees};
