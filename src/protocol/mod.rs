//! Signed coordinator ↔ worker protocol.
//!
//! - `messages`: request/response bodies for dispatch, cancel, callbacks and log chunks
//! - `signing`: HMAC-SHA256 signatures over `"{timestamp}.{body}"`

pub mod messages;
pub mod signing;

pub use messages::{
    AcceptResponse, CallbackStatus, CancelRequest, CompletionCallback, DispatchRequest, LogChunk,
};
pub use signing::{SignedBody, derive_task_secret, sign, verify, verify_headers};
