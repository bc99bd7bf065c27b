//! # Beacon Common Library
//!
//! Shared infrastructure code used by all Beacon crates.
//!
//! This crate provides:
//! - The stream backend abstraction over Redis Streams (XADD, XREADGROUP,
//!   XACK, XPENDING, XCLAIM and friends) with an in-memory twin for tests
//! - Custom error types
//! - Structured logging setup

// Module declarations
pub mod error;
pub mod logging;
pub mod stream;

// Re-export commonly used types
pub use error::{Error, Result};
pub use logging::{init_tracing, init_tracing_json};
pub use stream::{
    GroupInfo, GroupStart, PendingEntry, PendingSummary, RedisStreamClient, StreamBackend,
    StreamEntry, StreamInfo,
};
