//! Error types for Beacon
//!
//! One error enum shared by the bus, the task queue and the admin surface.
//! Recoverable conditions (backend blips, saturation) get their own variants
//! so callers can match on them instead of string-sniffing.

use thiserror::Error;

/// Main error type for Beacon operations
#[derive(Debug, Error)]
pub enum Error {
    /// Raw Redis errors (protocol, parsing, server replies)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The stream backend stayed unreachable after internal retries
    #[error("Stream backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Envelope or payload failed schema checks
    #[error("Validation error: {0}")]
    Validation(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The task queue cannot accept more work right now
    #[error("Task queue saturated: {0}")]
    Saturated(String),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Whether a caller should expect this condition to clear on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable(_) | Error::Saturated(_) | Error::Redis(_)
        )
    }
}

/// Result type alias for Beacon operations
pub type Result<T> = std::result::Result<T, Error>;
