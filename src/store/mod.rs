//! Persistence layer: libSQL-backed task records and log chunks.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::TaskStore;
