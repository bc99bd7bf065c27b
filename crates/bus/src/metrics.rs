/*!
 * Prometheus Metrics for the Event Bus
 *
 * Registered into the default registry; the admin surface renders them on
 * /metrics.
 */

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounterVec, opts, register_histogram_vec, register_int_counter_vec,
};

lazy_static! {
    /// Envelopes accepted by Publish
    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_bus_events_published_total", "Envelopes appended to streams"),
        &["stream"]
    )
    .expect("metric can be created");

    /// Entries delivered to consumer loops
    pub static ref EVENTS_CONSUMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_bus_events_consumed_total", "Entries delivered to consumers"),
        &["stream", "group"]
    )
    .expect("metric can be created");

    /// Handler outcomes by tag (ok, retry, fatal)
    pub static ref HANDLER_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_bus_handler_outcomes_total", "Handler outcomes by tag"),
        &["stream", "group", "outcome"]
    )
    .expect("metric can be created");

    /// Entries moved to a dead-letter sibling
    pub static ref DEAD_LETTERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_bus_dead_lettered_total", "Entries moved to dead-letter streams"),
        &["stream", "reason"]
    )
    .expect("metric can be created");

    /// Pending entries claimed from other consumers
    pub static ref ENTRIES_CLAIMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_bus_entries_claimed_total", "Stale pending entries claimed"),
        &["stream", "group"]
    )
    .expect("metric can be created");

    /// Dead letters re-appended to their origin stream
    pub static ref REPUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_bus_republished_total", "Dead letters republished to origin"),
        &["stream"]
    )
    .expect("metric can be created");

    /// End-to-end dispatch duration (decode + validate + handler)
    pub static ref DISPATCH_DURATION: HistogramVec = register_histogram_vec!(
        "beacon_bus_dispatch_duration_seconds",
        "Entry dispatch duration in seconds",
        &["stream", "group"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0]
    )
    .expect("metric can be created");
}
