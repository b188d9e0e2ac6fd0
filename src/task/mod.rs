//! Task records: the coordinator's single source of truth for status.

pub mod model;
pub mod state;

pub use model::{CreateTaskRequest, TaskRecord, WorkerType, validate_repository};
pub use state::TaskStatus;
