/*!
 * Dead-letter handling
 *
 * Envelopes that exhausted their retries, failed fatally, or could not even
 * be decoded land on the `<stream>.dead` sibling. The copy keeps the full
 * original envelope; provenance rides in `metadata`:
 *
 * - `original_group` / `original_consumer` — who gave up on it
 * - `failure_reason` — `retry-exhausted`, `handler-fatal`, `decode-failed`
 *   or a validation code (`UNKNOWN_TYPE`, `UNSUPPORTED_VERSION`,
 *   `INVALID_PAYLOAD`)
 * - `last_error` — the last error string
 * - `dead_lettered_at` — when it was moved
 *
 * Republish walks the sibling and re-appends entries younger than `max_age`
 * to the origin stream, recording the dead-letter entry id under
 * `metadata.original_id` before deleting the sibling entry. Because
 * handlers are idempotent on replay, republishing a message that somehow
 * also succeeded earlier converges to the same state.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use beacon_common::stream::{entry_timestamp_ms, StreamBackend};
use beacon_common::Result;
use beacon_events::{Envelope, EventStream};

use crate::bus::BusConfig;
use crate::metrics;

/// Failure classes recorded under `metadata.failure_reason`.
pub(crate) const REASON_RETRY_EXHAUSTED: &str = "retry-exhausted";
pub(crate) const REASON_HANDLER_FATAL: &str = "handler-fatal";
pub(crate) const REASON_DECODE_FAILED: &str = "decode-failed";

/// Append a decoded envelope to the dead-letter sibling.
pub(crate) async fn dead_letter_envelope(
    backend: &Arc<dyn StreamBackend>,
    config: &BusConfig,
    envelope: &Envelope,
    group: &str,
    consumer: &str,
    failure_reason: &str,
    last_error: &str,
) -> Result<String> {
    let mut copy = envelope.clone();
    copy.insert_metadata("original_group", json!(group));
    copy.insert_metadata("original_consumer", json!(consumer));
    copy.insert_metadata("failure_reason", json!(failure_reason));
    copy.insert_metadata("last_error", json!(last_error));
    copy.insert_metadata("dead_lettered_at", json!(Utc::now().to_rfc3339()));

    let dead_stream = envelope.stream.dead_letter_name();
    let id = backend
        .append(&dead_stream, &copy.encode(), config.max_length)
        .await?;

    metrics::DEAD_LETTERED_TOTAL
        .with_label_values(&[envelope.stream.as_str(), failure_reason])
        .inc();

    warn!(
        stream = %envelope.stream,
        envelope_id = %envelope.id,
        reason = failure_reason,
        error = last_error,
        "Dead-lettered envelope"
    );

    Ok(id)
}

/// Append an entry that could not be decoded. The raw fields are preserved
/// with flat provenance keys so an operator can still inspect it.
pub(crate) async fn dead_letter_raw(
    backend: &Arc<dyn StreamBackend>,
    config: &BusConfig,
    stream: EventStream,
    raw_fields: &HashMap<String, String>,
    group: &str,
    consumer: &str,
    last_error: &str,
) -> Result<String> {
    let mut fields: Vec<(String, String)> = raw_fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    fields.sort();
    fields.push(("original_group".to_string(), group.to_string()));
    fields.push(("original_consumer".to_string(), consumer.to_string()));
    fields.push(("failure_reason".to_string(), REASON_DECODE_FAILED.to_string()));
    fields.push(("last_error".to_string(), last_error.to_string()));
    fields.push(("dead_lettered_at".to_string(), Utc::now().to_rfc3339()));

    let dead_stream = stream.dead_letter_name();
    let id = backend
        .append(&dead_stream, &fields, config.max_length)
        .await?;

    metrics::DEAD_LETTERED_TOTAL
        .with_label_values(&[stream.as_str(), REASON_DECODE_FAILED])
        .inc();

    warn!(stream = %stream, error = last_error, "Dead-lettered undecodable entry");
    Ok(id)
}

/// Re-append dead letters younger than `max_age` to the origin stream.
/// Only entries dead-lettered by `group` are touched. Returns the count.
pub(crate) async fn republish_dead_letters(
    backend: &Arc<dyn StreamBackend>,
    config: &BusConfig,
    stream: EventStream,
    group: &str,
    max_age: Duration,
) -> Result<usize> {
    republish_dead_letters_at(
        backend,
        config,
        stream,
        group,
        max_age,
        Utc::now().timestamp_millis() as u64,
    )
    .await
}

/// Inner republish with an explicit clock, so the age window is testable.
pub(crate) async fn republish_dead_letters_at(
    backend: &Arc<dyn StreamBackend>,
    config: &BusConfig,
    stream: EventStream,
    group: &str,
    max_age: Duration,
    now_ms: u64,
) -> Result<usize> {
    const SCAN_LIMIT: usize = 10_000;

    let dead_stream = stream.dead_letter_name();
    let entries = backend.range(&dead_stream, "-", "+", SCAN_LIMIT).await?;
    let max_age_ms = max_age.as_millis() as u64;

    let mut republished = 0usize;
    for entry in entries {
        let Some(entry_ms) = entry_timestamp_ms(&entry.id) else {
            continue;
        };
        let age_ms = now_ms.saturating_sub(entry_ms);
        if age_ms > max_age_ms {
            continue;
        }

        // Undecodable dead letters cannot be re-dispatched; leave them for
        // manual inspection.
        let Ok(mut envelope) = Envelope::decode(&entry.fields) else {
            continue;
        };

        let original_group = envelope
            .metadata
            .as_ref()
            .and_then(|m| m.get("original_group"))
            .and_then(|v| v.as_str());
        if original_group != Some(group) {
            continue;
        }

        envelope.insert_metadata("original_id", json!(entry.id));

        backend
            .append(stream.as_str(), &envelope.encode(), config.max_length)
            .await?;
        backend.delete(&dead_stream, &[entry.id.clone()]).await?;

        metrics::REPUBLISHED_TOTAL
            .with_label_values(&[stream.as_str()])
            .inc();
        republished += 1;
    }

    if republished > 0 {
        info!(
            stream = %stream,
            group,
            republished,
            "Republished dead letters to origin stream"
        );
    }

    Ok(republished)
}
