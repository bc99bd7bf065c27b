//! Handler contract
//!
//! Subscribers implement [`EventHandler`] and report what happened through
//! [`HandlerOutcome`]. Retry is the bus's responsibility: a handler that
//! hits a transient failure returns `Retry` and gets the same envelope
//! again later; it never loops internally.
//!
//! Delivery is at-least-once, so handlers must be idempotent on their
//! observable effects (upserts keyed by `envelope.id` or a domain key
//! inside `data`).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use beacon_events::Envelope;

/// What a handler did with a delivered envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Effect applied; the bus ACKs the entry.
    Ok,
    /// Transient failure (network blip, upstream 5xx). The entry stays
    /// pending and is re-delivered, counted against `max_retries`.
    Retry(String),
    /// Permanent failure (validation, upstream 4xx). Dead-lettered
    /// immediately, no further attempts.
    Fatal(String),
}

/// Per-delivery context passed alongside the envelope.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Backend entry id of this delivery
    pub entry_id: String,

    /// How many times this entry has been delivered, this one included
    pub delivery_count: u64,

    /// Fired on shutdown; handlers honor it to participate in graceful
    /// drain. Returning `Retry` after cancellation leaves the entry
    /// pending for the replacement process.
    pub cancel: CancellationToken,
}

/// A subscriber for envelopes on one (stream, group) pair.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, ctx: &HandlerContext) -> HandlerOutcome;

    /// Name used in logs and metrics.
    fn name(&self) -> &str {
        "handler"
    }
}
