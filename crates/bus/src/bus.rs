/*!
 * Event Bus
 *
 * The public surface: publish, subscribe/unsubscribe, introspection and
 * dead-letter republish. The bus owns the consumer loops; the lifecycle
 * owner constructs it once and passes it to producers and subscribers as an
 * explicit dependency (no module-level singletons).
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beacon_common::stream::{GroupInfo, GroupStart, StreamBackend, StreamInfo};
use beacon_common::{Error, Result};
use beacon_events::{Envelope, EventStream, SchemaRegistry};

use crate::consumer::{ConsumerLoop, ConsumerStatus};
use crate::dead_letter;
use crate::metrics;

/// Bus tuning, lifted from the `streams` and `consumers` config sections.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Deliveries before a retryable failure dead-letters the entry
    pub max_retries: u64,
    /// Base redelivery spacing for a consumer's own pending entries
    pub retry_delay_ms: u64,
    /// Approximate MAXLEN cap applied on every append
    pub max_length: usize,
    /// Namespace prefix for every consumer group
    pub group_prefix: String,
    /// XREADGROUP BLOCK time
    pub block_time_ms: u64,
    /// Claim threshold and pending-sweep cadence
    pub claim_idle_time_ms: u64,
    /// Entries per group read
    pub batch_size: usize,
}

impl BusConfig {
    pub fn from_config(config: &beacon_config::Config) -> Self {
        Self {
            max_retries: config.streams.max_retries,
            retry_delay_ms: config.streams.retry_delay_ms,
            max_length: config.streams.max_length,
            group_prefix: config.consumers.group_prefix.clone(),
            block_time_ms: config.consumers.block_time_ms,
            claim_idle_time_ms: config.consumers.claim_idle_time_ms,
            batch_size: config.consumers.batch_size,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_length: 100_000,
            group_prefix: "beacon".to_string(),
            block_time_ms: 5_000,
            claim_idle_time_ms: 30_000,
            batch_size: 100,
        }
    }
}

/// Per-subscription options.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Unique consumer name within the group; defaults to
    /// `<hostname>-consumer-<n>`
    pub consumer_name: Option<String>,
    /// Parallel handler invocations within this subscription. 1 preserves
    /// per-stream order.
    pub concurrency: usize,
    /// Only these event types reach the handler; others are ACKed as no-ops
    pub filter_types: Option<Vec<String>>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            consumer_name: None,
            concurrency: 1,
            filter_types: None,
        }
    }
}

/// Opaque reference to an active subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    pub stream: EventStream,
    pub group: String,
    pub consumer: String,
}

/// Health row for one consumer loop.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionHealth {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub status: String,
}

struct SubscriptionState {
    stream: EventStream,
    group: String,
    consumer: String,
    cancel: CancellationToken,
    status: Arc<ConsumerStatus>,
    join: JoinHandle<()>,
}

/// Redis-Streams-backed event bus with competing consumer groups.
pub struct EventBus {
    backend: Arc<dyn StreamBackend>,
    registry: Arc<SchemaRegistry>,
    config: BusConfig,
    subscriptions: Mutex<HashMap<u64, SubscriptionState>>,
    next_subscription_id: AtomicU64,
    shutdown: CancellationToken,
}

impl EventBus {
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        registry: Arc<SchemaRegistry>,
        config: BusConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StreamBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Validate and append one envelope. Returns the backend entry id.
    ///
    /// Fails with [`Error::Validation`] before touching the backend, or
    /// [`Error::BackendUnavailable`] once internal retries are exhausted.
    pub async fn publish(&self, envelope: &Envelope) -> Result<String> {
        self.registry
            .validate_envelope(envelope)
            .map_err(|e| Error::Validation(e.to_string()))?;

        let entry_id = self
            .backend
            .append(
                envelope.stream.as_str(),
                &envelope.encode(),
                self.config.max_length,
            )
            .await?;

        metrics::EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[envelope.stream.as_str()])
            .inc();

        debug!(
            stream = %envelope.stream,
            event_type = %envelope.event_type,
            envelope_id = %envelope.id,
            entry_id = %entry_id,
            "Published envelope"
        );

        Ok(entry_id)
    }

    /// Register a handler on `(stream, group)` and start its consumer loop.
    ///
    /// The group is namespaced as `<group_prefix>.<group>` and created from
    /// `$` (new messages only) on first use.
    pub async fn subscribe(
        &self,
        stream: EventStream,
        group: &str,
        handler: Arc<dyn crate::handler::EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        if options.concurrency == 0 {
            return Err(Error::Config(
                "subscription concurrency must be at least 1".to_string(),
            ));
        }

        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let full_group = format!("{}.{}", self.config.group_prefix, group);
        let consumer = options
            .consumer_name
            .clone()
            .unwrap_or_else(|| beacon_config::Config::default_consumer_name(&format!("consumer-{id}")));

        self.backend
            .ensure_group(stream.as_str(), &full_group, GroupStart::NewOnly)
            .await?;

        let cancel = self.shutdown.child_token();
        let status = Arc::new(ConsumerStatus::new());

        let consumer_loop = Arc::new(ConsumerLoop {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            stream,
            group: full_group.clone(),
            consumer: consumer.clone(),
            handler,
            filter_types: options.filter_types,
            max_concurrency: options.concurrency,
            concurrency: Arc::new(Semaphore::new(options.concurrency)),
            cancel: cancel.clone(),
            status: Arc::clone(&status),
        });

        let join = tokio::spawn(consumer_loop.run());

        self.subscriptions.lock().await.insert(
            id,
            SubscriptionState {
                stream,
                group: full_group.clone(),
                consumer: consumer.clone(),
                cancel,
                status,
                join,
            },
        );

        info!(
            stream = %stream,
            group = %full_group,
            consumer = %consumer,
            concurrency = options.concurrency,
            "Subscribed"
        );

        Ok(SubscriptionHandle {
            id,
            stream,
            group: full_group,
            consumer,
        })
    }

    /// Cooperatively stop one subscription. The in-flight handler finishes;
    /// un-ACKed entries stay pending for later claim.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let state = self.subscriptions.lock().await.remove(&handle.id);
        let Some(state) = state else {
            warn!(subscription = handle.id, "Unsubscribe on unknown handle");
            return Ok(());
        };

        state.cancel.cancel();
        if state.join.await.is_err() {
            warn!(
                stream = %state.stream,
                group = %state.group,
                "Consumer loop panicked during unsubscribe"
            );
        }

        info!(
            stream = %state.stream,
            group = %state.group,
            consumer = %state.consumer,
            "Unsubscribed"
        );
        Ok(())
    }

    /// Stop every subscription, waiting for in-flight handlers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut subscriptions = self.subscriptions.lock().await;
        for (_, state) in subscriptions.drain() {
            if state.join.await.is_err() {
                warn!(
                    stream = %state.stream,
                    group = %state.group,
                    "Consumer loop panicked during shutdown"
                );
            }
        }
        info!("Event bus shut down");
    }

    /// XINFO STREAM for any stream name, including `.dead` siblings.
    pub async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        self.backend.stream_info(stream).await
    }

    /// XINFO GROUPS for any stream name.
    pub async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        self.backend.group_info(stream).await
    }

    /// Re-append dead letters younger than `max_age` that were dead-lettered
    /// by `group` (unprefixed name). Returns the republished count.
    pub async fn republish_dead_letters(
        &self,
        stream: EventStream,
        group: &str,
        max_age: Duration,
    ) -> Result<usize> {
        let full_group = format!("{}.{}", self.config.group_prefix, group);
        dead_letter::republish_dead_letters(
            &self.backend,
            &self.config,
            stream,
            &full_group,
            max_age,
        )
        .await
    }

    /// Health of every active consumer loop.
    pub async fn subscription_health(&self) -> Vec<SubscriptionHealth> {
        let subscriptions = self.subscriptions.lock().await;
        let mut rows: Vec<SubscriptionHealth> = subscriptions
            .values()
            .map(|state| SubscriptionHealth {
                stream: state.stream.as_str().to_string(),
                group: state.group.clone(),
                consumer: state.consumer.clone(),
                status: state.status.as_str().to_string(),
            })
            .collect();
        rows.sort_by(|a, b| (&a.stream, &a.group).cmp(&(&b.stream, &b.group)));
        rows
    }

    /// True when every consumer loop is in the `running` state.
    pub async fn all_consumers_running(&self) -> bool {
        self.subscriptions
            .lock()
            .await
            .values()
            .all(|state| state.status.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beacon_common::stream::memory::MemoryStreamClient;
    use beacon_events::SchemaRegistry;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    use crate::handler::{EventHandler, HandlerContext, HandlerOutcome};

    /// Test config with millisecond-scale timings
    fn fast_config() -> BusConfig {
        BusConfig {
            max_retries: 3,
            retry_delay_ms: 1,
            max_length: 1_000,
            group_prefix: "test".to_string(),
            block_time_ms: 20,
            claim_idle_time_ms: 40,
            batch_size: 100,
        }
    }

    fn new_bus(backend: Arc<dyn StreamBackend>) -> EventBus {
        EventBus::new(
            backend,
            Arc::new(SchemaRegistry::with_defaults()),
            fast_config(),
        )
    }

    fn registered_user(n: u32) -> Envelope {
        Envelope::new(
            EventStream::User,
            "user.registered",
            json!({"user_id": format!("u-{n}"), "email": "a@b.c", "tier": "individual_pro"}),
        )
    }

    /// Handler scripted by outcome; counts invocations.
    struct ScriptedHandler {
        calls: AtomicUsize,
        outcome: fn(u64) -> HandlerOutcome,
    }

    impl ScriptedHandler {
        fn new(outcome: fn(u64) -> HandlerOutcome) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(&self, _envelope: &Envelope, ctx: &HandlerContext) -> HandlerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(ctx.delivery_count)
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool, timeout_ms: u64) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    async fn wait_for_len(backend: &MemoryStreamClient, stream: &str, expected: usize) -> bool {
        for _ in 0..300 {
            if backend.len(stream).await.unwrap() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn wait_for_pending_zero(backend: &MemoryStreamClient, stream: &str, group: &str) -> bool {
        for _ in 0..300 {
            if backend.pending_summary(stream, group).await.unwrap().total == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn wait_for_delivery(
        backend: &MemoryStreamClient,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> bool {
        for _ in 0..300 {
            let delivered = backend
                .group_info(stream)
                .await
                .unwrap()
                .iter()
                .any(|g| g.name == group && g.last_delivered_id == entry_id);
            if delivered {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_publish_validates_before_append() {
        let backend = Arc::new(MemoryStreamClient::new());
        let bus = new_bus(backend.clone());

        // Unknown type is rejected pre-publish
        let bad = Envelope::new(EventStream::User, "invoice.settled", json!({}));
        assert!(matches!(
            bus.publish(&bad).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(backend.len("user.events").await.unwrap(), 0);

        // Valid envelope lands on the stream
        bus.publish(&registered_user(1)).await.unwrap();
        assert_eq!(backend.len("user.events").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_round_trip_handler_invoked_once_and_acked() {
        let backend = Arc::new(MemoryStreamClient::new());
        let bus = new_bus(backend.clone());
        let handler = ScriptedHandler::new(|_| HandlerOutcome::Ok);

        let handle = bus
            .subscribe(
                EventStream::User,
                "users",
                handler.clone(),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        bus.publish(&registered_user(1)).await.unwrap();

        assert!(wait_until(|| handler.calls() == 1, 2_000).await);
        // Exactly once, ACKed: nothing pending
        assert!(wait_for_pending_zero(&backend, "user.events", "test.users").await);
        assert_eq!(handler.calls(), 1);

        bus.unsubscribe(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter_after_max_retries() {
        let backend = Arc::new(MemoryStreamClient::new());
        let bus = new_bus(backend.clone());
        let handler = ScriptedHandler::new(|_| HandlerOutcome::Retry("upstream 503".into()));

        let handle = bus
            .subscribe(
                EventStream::User,
                "users",
                handler.clone(),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        bus.publish(&registered_user(1)).await.unwrap();

        // 3 deliveries total, then the dead-letter copy appears
        assert!(wait_for_len(&backend, "user.events.dead", 1).await);
        assert_eq!(handler.calls(), 3);

        // Origin entry is ACKed: forward progress guaranteed
        let summary = backend
            .pending_summary("user.events", "test.users")
            .await
            .unwrap();
        assert_eq!(summary.total, 0);

        // Dead-letter copy carries provenance
        let dead = backend.range("user.events.dead", "-", "+", 10).await.unwrap();
        let envelope = Envelope::decode(&dead[0].fields).unwrap();
        let metadata = envelope.metadata.unwrap();
        assert_eq!(metadata["failure_reason"], json!("retry-exhausted"));
        assert_eq!(metadata["original_group"], json!("test.users"));
        assert_eq!(metadata["last_error"], json!("upstream 503"));

        bus.unsubscribe(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_outcome_dead_letters_immediately() {
        let backend = Arc::new(MemoryStreamClient::new());
        let bus = new_bus(backend.clone());
        let handler = ScriptedHandler::new(|_| HandlerOutcome::Fatal("bad tier".into()));

        let handle = bus
            .subscribe(
                EventStream::User,
                "users",
                handler.clone(),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        bus.publish(&registered_user(1)).await.unwrap();

        assert!(wait_for_len(&backend, "user.events.dead", 1).await);
        // No retries for fatal outcomes
        assert_eq!(handler.calls(), 1);

        let dead = backend.range("user.events.dead", "-", "+", 10).await.unwrap();
        let envelope = Envelope::decode(&dead[0].fields).unwrap();
        assert_eq!(
            envelope.metadata.unwrap()["failure_reason"],
            json!("handler-fatal")
        );

        bus.unsubscribe(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_on_consume_dead_letters() {
        let backend = Arc::new(MemoryStreamClient::new());
        let bus = new_bus(backend.clone());
        let handler = ScriptedHandler::new(|_| HandlerOutcome::Ok);

        let handle = bus
            .subscribe(
                EventStream::User,
                "users",
                handler.clone(),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        // A foreign producer appends a type this registry does not know,
        // bypassing publish-side validation
        let mut rogue = registered_user(1);
        rogue.event_type = "user.deleted".to_string();
        backend
            .append("user.events", &rogue.encode(), 1_000)
            .await
            .unwrap();

        assert!(wait_for_len(&backend, "user.events.dead", 1).await);
        // Handler never saw it
        assert_eq!(handler.calls(), 0);

        let dead = backend.range("user.events.dead", "-", "+", 10).await.unwrap();
        let envelope = Envelope::decode(&dead[0].fields).unwrap();
        assert_eq!(
            envelope.metadata.unwrap()["failure_reason"],
            json!("UNKNOWN_TYPE")
        );

        bus.unsubscribe(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_filtered_types_acked_as_noops() {
        let backend = Arc::new(MemoryStreamClient::new());
        let bus = new_bus(backend.clone());
        let handler = ScriptedHandler::new(|_| HandlerOutcome::Ok);

        let handle = bus
            .subscribe(
                EventStream::User,
                "users",
                handler.clone(),
                SubscribeOptions {
                    filter_types: Some(vec!["user.login".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let entry_id = bus.publish(&registered_user(1)).await.unwrap();

        // Filtered out: delivered to the group and ACKed without reaching
        // the handler
        assert!(wait_for_delivery(&backend, "user.events", "test.users", &entry_id).await);
        assert!(wait_for_pending_zero(&backend, "user.events", "test.users").await);
        assert_eq!(handler.calls(), 0);

        bus.unsubscribe(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_entries_claimed_from_dead_consumer() {
        let backend = Arc::new(MemoryStreamClient::new());
        let bus = new_bus(backend.clone());

        // Simulate a consumer that read an entry and died without ACKing
        backend
            .ensure_group("user.events", "test.users", GroupStart::NewOnly)
            .await
            .unwrap();
        backend
            .append("user.events", &registered_user(1).encode(), 1_000)
            .await
            .unwrap();
        let orphaned = backend
            .read_group("user.events", "test.users", "dead-consumer", 10, 10)
            .await
            .unwrap();
        assert_eq!(orphaned.len(), 1);

        // Let it go idle past the claim threshold
        tokio::time::sleep(Duration::from_millis(60)).await;

        let handler = ScriptedHandler::new(|_| HandlerOutcome::Ok);
        let handle = bus
            .subscribe(
                EventStream::User,
                "users",
                handler.clone(),
                SubscribeOptions {
                    consumer_name: Some("survivor".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // The survivor claims and handles the orphaned entry, then ACKs
        assert!(wait_until(|| handler.calls() == 1, 3_000).await);
        assert!(wait_for_pending_zero(&backend, "user.events", "test.users").await);

        bus.unsubscribe(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_concurrency_is_bounded() {
        use std::sync::atomic::AtomicI64;

        let backend = Arc::new(MemoryStreamClient::new());
        let bus = new_bus(backend.clone());

        struct GaugeHandler {
            current: AtomicI64,
            peak: AtomicI64,
            done: AtomicUsize,
        }

        #[async_trait]
        impl EventHandler for GaugeHandler {
            async fn handle(&self, _: &Envelope, _: &HandlerContext) -> HandlerOutcome {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                self.done.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::Ok
            }
        }

        let handler = Arc::new(GaugeHandler {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            done: AtomicUsize::new(0),
        });

        let handle = bus
            .subscribe(
                EventStream::User,
                "users",
                handler.clone(),
                SubscribeOptions {
                    concurrency: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for n in 0..6 {
            bus.publish(&registered_user(n)).await.unwrap();
        }

        assert!(
            wait_until(|| handler.done.load(Ordering::SeqCst) == 6, 5_000).await
        );
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);

        bus.unsubscribe(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_republish_respects_age_window() {
        let backend: Arc<dyn StreamBackend> = Arc::new(MemoryStreamClient::new());
        let config = fast_config();

        let mut dead = registered_user(1);
        dead.insert_metadata("original_group", json!("test.users"));
        backend
            .append("user.events.dead", &dead.encode(), 1_000)
            .await
            .unwrap();

        // Pretend 120 s passed: the entry falls outside a 60 s window
        let now_ms = chrono::Utc::now().timestamp_millis() as u64 + 120_000;
        let count = dead_letter::republish_dead_letters_at(
            &backend,
            &config,
            EventStream::User,
            "test.users",
            Duration::from_secs(60),
            now_ms,
        )
        .await
        .unwrap();
        assert_eq!(count, 0);
        assert_eq!(backend.len("user.events.dead").await.unwrap(), 1);

        // Pretend only 10 s passed: republished and removed from the sibling
        let now_ms = chrono::Utc::now().timestamp_millis() as u64 + 10_000;
        let count = dead_letter::republish_dead_letters_at(
            &backend,
            &config,
            EventStream::User,
            "test.users",
            Duration::from_secs(60),
            now_ms,
        )
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(backend.len("user.events.dead").await.unwrap(), 0);
        assert_eq!(backend.len("user.events").await.unwrap(), 1);

        // Republished copy records where it came from
        let entries = backend.range("user.events", "-", "+", 10).await.unwrap();
        let envelope = Envelope::decode(&entries[0].fields).unwrap();
        assert!(envelope.metadata.unwrap().contains_key("original_id"));
    }

    #[tokio::test]
    async fn test_unsubscribe_lets_in_flight_handler_finish() {
        let backend = Arc::new(MemoryStreamClient::new());
        let bus = new_bus(backend.clone());

        struct SlowHandler {
            started: AtomicUsize,
            finished: AtomicUsize,
        }

        #[async_trait]
        impl EventHandler for SlowHandler {
            async fn handle(&self, _: &Envelope, _: &HandlerContext) -> HandlerOutcome {
                self.started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.finished.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::Ok
            }
        }

        let handler = Arc::new(SlowHandler {
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });

        let handle = bus
            .subscribe(
                EventStream::User,
                "users",
                handler.clone(),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        bus.publish(&registered_user(1)).await.unwrap();
        assert!(
            wait_until(|| handler.started.load(Ordering::SeqCst) == 1, 2_000).await
        );

        // Unsubscribe returns only after the running handler completed
        bus.unsubscribe(handle).await.unwrap();
        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
    }
}
