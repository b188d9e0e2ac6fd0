//! Task Relay: dispatches coding-agent tasks to edge workers and tracks
//! them to completion.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod forwarder;
pub mod protocol;
pub mod store;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
