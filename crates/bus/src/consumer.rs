/*!
 * Consumer Loop
 *
 * One loop per (stream, group, consumer) triple, running as an independent
 * tokio task. Each iteration:
 *
 * ```text
 * 1. Recover   read own pending entries (prior, partially-delivered work)
 * 2. Sweep     every claim interval:
 *                - re-deliver own pending entries whose idle time passed
 *                  the per-entry retry backoff
 *                - claim entries other consumers left idle past the claim
 *                  threshold (heals crashed consumers, no coordination)
 * 3. Read      XREADGROUP BLOCK for new entries
 * 4. Dispatch  decode -> validate -> handler, bounded by the subscription's
 *              concurrency
 * 5. Outcome   Ok: ACK | Retry: leave pending (dead-letter once the
 *              delivery count reaches max_retries) | Fatal: dead-letter
 * ```
 *
 * Backend read failures back off exponentially and flip the consumer to
 * `disconnected` until a read succeeds again.
 */

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use beacon_common::stream::{StreamBackend, StreamEntry};
use beacon_events::{Envelope, EventStream, SchemaRegistry};

use crate::bus::BusConfig;
use crate::dead_letter::{
    dead_letter_envelope, dead_letter_raw, REASON_HANDLER_FATAL, REASON_RETRY_EXHAUSTED,
};
use crate::handler::{EventHandler, HandlerContext, HandlerOutcome};
use crate::metrics;

/// Upper bound on redelivery backoff for own pending entries
const MAX_REDELIVERY_BACKOFF_MS: u64 = 60_000;

/// Pending entries examined per sweep
const SWEEP_LIMIT: usize = 1024;

/// Read-failure backoff cap
const MAX_READ_BACKOFF: Duration = Duration::from_secs(30);

/// Observable state of one consumer loop.
#[derive(Debug)]
pub(crate) struct ConsumerStatus(AtomicU8);

const STATUS_RUNNING: u8 = 0;
const STATUS_DISCONNECTED: u8 = 1;
const STATUS_STOPPED: u8 = 2;

impl ConsumerStatus {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(STATUS_RUNNING))
    }

    fn set(&self, value: u8) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self.0.load(Ordering::SeqCst) {
            STATUS_RUNNING => "running",
            STATUS_DISCONNECTED => "disconnected",
            _ => "stopped",
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst) == STATUS_RUNNING
    }
}

/// State shared by one consumer loop and its dispatch tasks.
pub(crate) struct ConsumerLoop {
    pub(crate) backend: Arc<dyn StreamBackend>,
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) config: BusConfig,
    pub(crate) stream: EventStream,
    /// Fully namespaced group (`<prefix>.<group>`)
    pub(crate) group: String,
    pub(crate) consumer: String,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) filter_types: Option<Vec<String>>,
    pub(crate) max_concurrency: usize,
    pub(crate) concurrency: Arc<Semaphore>,
    pub(crate) cancel: CancellationToken,
    pub(crate) status: Arc<ConsumerStatus>,
}

impl ConsumerLoop {
    pub(crate) async fn run(self: Arc<Self>) {
        info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            handler = self.handler.name(),
            "Starting consumer loop"
        );

        // Recover phase: prior deliveries that were never ACKed come first
        if let Err(e) = self.sweep_pending(true).await {
            warn!(
                stream = %self.stream,
                group = %self.group,
                error = %e,
                "Failed to recover pending entries on startup"
            );
        }

        let sweep_interval = Duration::from_millis(self.config.claim_idle_time_ms);
        let mut last_sweep = Instant::now();
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if last_sweep.elapsed() >= sweep_interval {
                if let Err(e) = self.sweep_pending(false).await {
                    debug!(stream = %self.stream, error = %e, "Pending sweep failed");
                }
                last_sweep = Instant::now();
            }

            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.backend.read_group(
                    self.stream.as_str(),
                    &self.group,
                    &self.consumer,
                    self.config.batch_size,
                    self.config.block_time_ms,
                ) => result,
            };

            let entries = match batch {
                Ok(entries) => {
                    if consecutive_errors > 0 {
                        info!(
                            stream = %self.stream,
                            consumer = %self.consumer,
                            "Backend reachable again after {} failed reads",
                            consecutive_errors
                        );
                        consecutive_errors = 0;
                    }
                    self.status.set(STATUS_RUNNING);
                    entries
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.status.set(STATUS_DISCONNECTED);
                    let backoff = Duration::from_secs(2u64.pow(consecutive_errors.min(5)))
                        .min(MAX_READ_BACKOFF);
                    error!(
                        stream = %self.stream,
                        consumer = %self.consumer,
                        error = %e,
                        consecutive_errors,
                        "Group read failed, backing off {:?}",
                        backoff
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    continue;
                }
            };

            if entries.is_empty() {
                continue;
            }

            // Fresh `>` reads are always first deliveries
            self.dispatch_batch(entries.into_iter().map(|e| (e, 1)).collect())
                .await;
        }

        self.status.set(STATUS_STOPPED);
        info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "Consumer loop stopped"
        );
    }

    /// Redeliver own overdue pending entries and claim stale ones from other
    /// consumers. On `initial` (loop start) every own pending entry is due
    /// immediately; afterwards each waits out its retry backoff.
    async fn sweep_pending(&self, initial: bool) -> beacon_common::Result<()> {
        let detail = self
            .backend
            .pending_detail(self.stream.as_str(), &self.group, SWEEP_LIMIT)
            .await?;

        if detail.is_empty() {
            return Ok(());
        }

        let mut due = Vec::new();
        let mut claimed_from_others = 0usize;
        for entry in &detail {
            if entry.consumer == self.consumer {
                let backoff = redelivery_backoff(self.config.retry_delay_ms, entry.delivery_count);
                if initial || entry.idle_ms >= backoff {
                    due.push(entry.clone());
                }
            } else if entry.idle_ms >= self.config.claim_idle_time_ms {
                due.push(entry.clone());
                claimed_from_others += 1;
            }
        }

        if due.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = due.iter().map(|e| e.id.clone()).collect();
        // Eligibility was decided above; claim unconditionally. Entries ACKed
        // in the meantime simply drop out of the reply.
        let bodies = self
            .backend
            .claim(self.stream.as_str(), &self.group, &self.consumer, 0, &ids)
            .await?;

        if claimed_from_others > 0 {
            metrics::ENTRIES_CLAIMED_TOTAL
                .with_label_values(&[self.stream.as_str(), &self.group])
                .inc_by(claimed_from_others as u64);
            info!(
                stream = %self.stream,
                group = %self.group,
                consumer = %self.consumer,
                count = claimed_from_others,
                "Claimed stale entries from other consumers"
            );
        }

        // The claim itself was a new delivery, hence +1
        let batch = bodies
            .into_iter()
            .map(|entry| {
                let prior = due
                    .iter()
                    .find(|d| d.id == entry.id)
                    .map(|d| d.delivery_count)
                    .unwrap_or(1);
                (entry, prior + 1)
            })
            .collect();
        self.dispatch_batch(batch).await;

        Ok(())
    }

    /// Dispatch a batch under the subscription's concurrency bound. With
    /// `concurrency: 1` this degenerates to in-order sequential dispatch.
    async fn dispatch_batch(&self, batch: Vec<(StreamEntry, u64)>) {
        metrics::EVENTS_CONSUMED_TOTAL
            .with_label_values(&[self.stream.as_str(), &self.group])
            .inc_by(batch.len() as u64);

        if self.max_concurrency == 1 {
            // Strict in-order dispatch, no task-spawn overhead
            for (entry, delivery_count) in batch {
                self.process_entry(entry, delivery_count).await;
            }
            return;
        }

        let mut join_set = JoinSet::new();
        for (entry, delivery_count) in batch {
            let semaphore = Arc::clone(&self.concurrency);
            let this = self.clone_refs();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                this.process_entry(entry, delivery_count).await;
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    /// Cheap clone of the shared pieces for spawned dispatch tasks.
    fn clone_refs(&self) -> Arc<ConsumerLoop> {
        Arc::new(ConsumerLoop {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            stream: self.stream,
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            handler: Arc::clone(&self.handler),
            filter_types: self.filter_types.clone(),
            max_concurrency: self.max_concurrency,
            concurrency: Arc::clone(&self.concurrency),
            cancel: self.cancel.clone(),
            status: Arc::clone(&self.status),
        })
    }

    async fn process_entry(&self, entry: StreamEntry, delivery_count: u64) {
        let timer = metrics::DISPATCH_DURATION
            .with_label_values(&[self.stream.as_str(), &self.group])
            .start_timer();

        let envelope = match Envelope::decode(&entry.fields) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Undecodable entries can never succeed; skip retries
                if let Err(dl_err) = dead_letter_raw(
                    &self.backend,
                    &self.config,
                    self.stream,
                    &entry.fields,
                    &self.group,
                    &self.consumer,
                    &e.to_string(),
                )
                .await
                {
                    error!(error = %dl_err, "Failed to dead-letter undecodable entry");
                    return; // entry stays pending, retried next sweep
                }
                self.ack(&entry.id).await;
                timer.observe_duration();
                return;
            }
        };

        if let Err(validation) = self
            .registry
            .validate(&envelope.event_type, envelope.version, &envelope.data)
        {
            if let Err(dl_err) = dead_letter_envelope(
                &self.backend,
                &self.config,
                &envelope,
                &self.group,
                &self.consumer,
                &validation.code.to_string(),
                &validation.details,
            )
            .await
            {
                error!(error = %dl_err, "Failed to dead-letter invalid envelope");
                return;
            }
            self.ack(&entry.id).await;
            timer.observe_duration();
            return;
        }

        // A group subscribed to a subset of types treats the rest as no-ops;
        // nothing else in this group will ever handle them.
        if let Some(filter) = &self.filter_types {
            if !filter.iter().any(|t| t == &envelope.event_type) {
                self.ack(&entry.id).await;
                timer.observe_duration();
                return;
            }
        }

        let ctx = HandlerContext {
            entry_id: entry.id.clone(),
            delivery_count,
            cancel: self.cancel.child_token(),
        };

        let outcome = self.handler.handle(&envelope, &ctx).await;
        let outcome_label = match &outcome {
            HandlerOutcome::Ok => "ok",
            HandlerOutcome::Retry(_) => "retry",
            HandlerOutcome::Fatal(_) => "fatal",
        };
        metrics::HANDLER_OUTCOMES_TOTAL
            .with_label_values(&[self.stream.as_str(), &self.group, outcome_label])
            .inc();

        match outcome {
            HandlerOutcome::Ok => {
                self.ack(&entry.id).await;
            }
            HandlerOutcome::Fatal(reason) => {
                if let Err(e) = dead_letter_envelope(
                    &self.backend,
                    &self.config,
                    &envelope,
                    &self.group,
                    &self.consumer,
                    REASON_HANDLER_FATAL,
                    &reason,
                )
                .await
                {
                    error!(error = %e, "Failed to dead-letter after fatal outcome");
                    timer.observe_duration();
                    return;
                }
                self.ack(&entry.id).await;
            }
            HandlerOutcome::Retry(reason) => {
                if delivery_count >= self.config.max_retries {
                    if let Err(e) = dead_letter_envelope(
                        &self.backend,
                        &self.config,
                        &envelope,
                        &self.group,
                        &self.consumer,
                        REASON_RETRY_EXHAUSTED,
                        &reason,
                    )
                    .await
                    {
                        error!(error = %e, "Failed to dead-letter after retry exhaustion");
                        timer.observe_duration();
                        return;
                    }
                    // ACK the origin so exhausted work cannot loop forever
                    self.ack(&entry.id).await;
                } else {
                    debug!(
                        stream = %self.stream,
                        entry_id = %entry.id,
                        delivery_count,
                        max_retries = self.config.max_retries,
                        reason,
                        "Handler asked for retry, leaving entry pending"
                    );
                }
            }
        }

        timer.observe_duration();
    }

    async fn ack(&self, entry_id: &str) {
        if let Err(e) = self
            .backend
            .ack(self.stream.as_str(), &self.group, &[entry_id.to_string()])
            .await
        {
            // The entry stays pending and will be re-dispatched; idempotent
            // handlers absorb the duplicate.
            error!(
                stream = %self.stream,
                entry_id,
                error = %e,
                "Failed to ACK entry"
            );
        }
    }
}

/// Exponential redelivery spacing for a consumer's own pending entries.
fn redelivery_backoff(base_delay_ms: u64, delivery_count: u64) -> u64 {
    let exponent = delivery_count.saturating_sub(1).min(16) as u32;
    base_delay_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(MAX_REDELIVERY_BACKOFF_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_backoff_doubles_and_caps() {
        assert_eq!(redelivery_backoff(1_000, 1), 1_000);
        assert_eq!(redelivery_backoff(1_000, 2), 2_000);
        assert_eq!(redelivery_backoff(1_000, 3), 4_000);
        assert_eq!(redelivery_backoff(1_000, 10), 60_000);
        // Degenerate delivery count still yields the base delay
        assert_eq!(redelivery_backoff(1_000, 0), 1_000);
    }

    #[test]
    fn test_consumer_status_transitions() {
        let status = ConsumerStatus::new();
        assert!(status.is_running());
        assert_eq!(status.as_str(), "running");

        status.set(STATUS_DISCONNECTED);
        assert_eq!(status.as_str(), "disconnected");
        assert!(!status.is_running());

        status.set(STATUS_STOPPED);
        assert_eq!(status.as_str(), "stopped");
    }
}
