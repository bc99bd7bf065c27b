//! Logging and tracing setup
//!
//! Structured logging configuration using tracing. Every binary calls one of
//! these once at startup; library crates only emit events.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging for the application
///
/// Reads the log level from `RUST_LOG`, defaulting to `info`.
///
/// ```text
/// RUST_LOG=debug cargo run          -> debug and higher
/// RUST_LOG=beacon_bus=trace         -> trace for the bus only
/// ```
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .compact(),
        )
        .init();
}

/// Initialize tracing with JSON output (for production)
///
/// Outputs one JSON object per line, for log aggregation systems such as
/// Grafana Loki or the ELK stack.
pub fn init_tracing_json() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_level(true)
                .with_current_span(true),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{error, info, warn};

    #[test]
    fn test_tracing_init() {
        // Only one subscriber may install per process; swallow the second init
        let _result = std::panic::catch_unwind(|| {
            init_tracing();
        });

        info!("Test log message");
        warn!(count = 42, "Warning with structured data");
        error!(error = "test error", "Error message");
    }
}
