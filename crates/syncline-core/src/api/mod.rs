//! REST transport for replaying queued actions.
//!
//! This module provides the `RequestExecutor` contract the coordinator
//! drains the queue through, and `RestClient`, its `reqwest`
//! implementation. Outcomes come back classified as `SyncError` variants
//! so retry decisions never have to look at raw HTTP responses.

pub mod client;

pub use client::{RequestExecutor, RestClient};
