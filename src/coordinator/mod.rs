//! Control plane: owns the canonical task records.
//!
//! Core components:
//! - `lifecycle`: create, dispatch, cancel, callbacks, log ingest
//! - `reconciler`: interrupts tasks whose worker went silent
//! - `selection`: picks a worker for a task
//! - `client`: signed calls to worker endpoints
//! - `routes`: user and worker HTTP surface

pub mod client;
pub mod lifecycle;
pub mod reconciler;
pub mod routes;
pub mod selection;

pub use client::{HttpWorkerClient, WorkerClient};
pub use lifecycle::{CoordinatorDeps, TaskCoordinator};
pub use reconciler::{ReconcileReport, spawn_reconciler};
pub use routes::coordinator_routes;
pub use selection::WorkerRegistry;
