/*!
 * Event-to-task bridge
 *
 * An [`EventHandler`] that turns task-bearing events into queued tasks. The
 * mapping from event type to task type is explicit; nothing is inferred
 * from type names. Saturation propagates back to the bus as `Retry`, so a
 * full queue leaves entries pending on the stream instead of growing
 * memory.
 */

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use beacon_bus::{EventHandler, HandlerContext, HandlerOutcome};
use beacon_common::Error;
use beacon_events::Envelope;

use crate::queue::TaskQueue;
use crate::task::{TaskPriority, TaskSpec};

/// The platform's standard task-bearing events: event type -> task type.
pub const DEFAULT_ROUTES: &[(&str, &str)] = &[
    ("embedding.requested", "embed.asset"),
    ("content.generation.requested", "generate.content"),
    ("consultation.requested", "run.consultation"),
    ("notification.requested", "send.notification"),
    ("market.collection.started", "collect.market.data"),
];

/// Routes task-bearing events into the queue.
pub struct TaskBridge {
    queue: Arc<TaskQueue>,
    /// event type -> task type
    routes: HashMap<String, String>,
}

impl TaskBridge {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            routes: HashMap::new(),
        }
    }

    /// Bridge preloaded with [`DEFAULT_ROUTES`].
    pub fn with_default_routes(queue: Arc<TaskQueue>) -> Self {
        DEFAULT_ROUTES
            .iter()
            .fold(Self::new(queue), |bridge, (event_type, task_type)| {
                bridge.route(*event_type, *task_type)
            })
    }

    /// Map one event type to a task type.
    pub fn route(
        mut self,
        event_type: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        self.routes.insert(event_type.into(), task_type.into());
        self
    }

    /// Event types this bridge consumes, for subscription filters.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.routes.keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl EventHandler for TaskBridge {
    async fn handle(&self, envelope: &Envelope, _ctx: &HandlerContext) -> HandlerOutcome {
        let Some(task_type) = self.routes.get(&envelope.event_type) else {
            // Subscription filters should keep these out; tolerate anyway
            return HandlerOutcome::Ok;
        };

        let Some(payload) = envelope.data.as_object() else {
            return HandlerOutcome::Fatal(format!(
                "task-bearing event '{}' carries a non-object payload",
                envelope.event_type
            ));
        };

        let mut payload = payload.clone();
        // Key for idempotent effects on at-least-once redelivery
        payload.insert("event_id".to_string(), json!(envelope.id));

        let priority = payload
            .get("priority")
            .and_then(|v| v.as_str())
            .and_then(|raw| serde_json::from_value::<TaskPriority>(json!(raw)).ok())
            .unwrap_or_default();
        let dedup_key = payload
            .get("dedup_key")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut spec = TaskSpec::new(task_type.clone(), payload).with_priority(priority);
        if let Some(user_id) = &envelope.user_id {
            spec = spec.with_user_id(user_id.clone());
        }
        if let Some(key) = dedup_key {
            spec = spec.with_dedup_key(key);
        }

        match self.queue.queue_task(spec) {
            Ok(outcome) => {
                if outcome.deduplicated {
                    debug!(
                        event_type = %envelope.event_type,
                        task_id = %outcome.id,
                        "Duplicate task suppressed by dedup key"
                    );
                }
                HandlerOutcome::Ok
            }
            // Backpressure: leave the entry pending, the stream absorbs it
            Err(Error::Saturated(reason)) => {
                warn!(
                    event_type = %envelope.event_type,
                    reason,
                    "Task queue saturated, leaving event pending"
                );
                HandlerOutcome::Retry(reason)
            }
            Err(e) => HandlerOutcome::Fatal(e.to_string()),
        }
    }

    fn name(&self) -> &str {
        "task-bridge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{TaskHandler, TaskOutcome};
    use crate::queue::TaskQueueConfig;
    use crate::task::Task;
    use beacon_common::stream::memory::MemoryStreamClient;
    use beacon_events::EventStream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn execute(&self, _: &Task, _: CancellationToken) -> TaskOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            TaskOutcome::Ok
        }
    }

    fn bridged_queue(max_queued: usize) -> (Arc<TaskQueue>, Arc<CountingHandler>) {
        let backend = Arc::new(MemoryStreamClient::new());
        let queue = Arc::new(TaskQueue::new(
            backend,
            TaskQueueConfig {
                max_queued,
                ..TaskQueueConfig::default()
            },
        ));
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        queue.register_handler("embed.asset", handler.clone()).unwrap();
        (queue, handler)
    }

    fn embedding_event() -> Envelope {
        Envelope::new(
            EventStream::Contextual,
            "embedding.requested",
            json!({"asset_id": "a-1", "content_hash": "H"}),
        )
        .with_user_id("u-1")
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            entry_id: "0-0".to_string(),
            delivery_count: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_routes_event_into_task() {
        let (queue, _) = bridged_queue(100);
        let bridge = TaskBridge::with_default_routes(queue.clone());

        let outcome = bridge.handle(&embedding_event(), &ctx()).await;
        assert_eq!(outcome, HandlerOutcome::Ok);

        let stats = queue.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.per_type["embed.asset"].enqueued, 1);
    }

    #[tokio::test]
    async fn test_event_id_propagated_for_idempotence() {
        let backend = Arc::new(MemoryStreamClient::new());
        let queue = Arc::new(TaskQueue::new(backend, TaskQueueConfig::default()));

        struct CaptureHandler {
            seen: std::sync::Mutex<Option<String>>,
        }

        #[async_trait]
        impl TaskHandler for CaptureHandler {
            async fn execute(&self, task: &Task, _: CancellationToken) -> TaskOutcome {
                *self.seen.lock().expect("capture poisoned") = task
                    .payload
                    .get("event_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                TaskOutcome::Ok
            }
        }

        let handler = Arc::new(CaptureHandler {
            seen: std::sync::Mutex::new(None),
        });
        queue.register_handler("embed.asset", handler.clone()).unwrap();
        queue.start().await.unwrap();

        let envelope = embedding_event();
        let bridge = TaskBridge::with_default_routes(queue.clone());
        bridge.handle(&envelope, &ctx()).await;

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if handler.seen.lock().expect("capture poisoned").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let seen = handler.seen.lock().expect("capture poisoned").clone();
        assert_eq!(seen, Some(envelope.id.to_string()));
        assert!(Uuid::parse_str(&seen.unwrap()).is_ok());

        queue.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_saturation_maps_to_retry() {
        let (queue, _) = bridged_queue(1);
        let bridge = TaskBridge::with_default_routes(queue.clone());

        assert_eq!(bridge.handle(&embedding_event(), &ctx()).await, HandlerOutcome::Ok);
        // Queue full (not started, nothing drains): the bus must not ACK
        assert!(matches!(
            bridge.handle(&embedding_event(), &ctx()).await,
            HandlerOutcome::Retry(_)
        ));
    }

    #[tokio::test]
    async fn test_unrouted_event_is_noop() {
        let (queue, _) = bridged_queue(100);
        let bridge = TaskBridge::with_default_routes(queue.clone());

        let envelope = Envelope::new(
            EventStream::Contextual,
            "asset.uploaded",
            json!({"asset_id": "a-1", "user_id": "u-1", "content_type": "text/plain"}),
        );
        assert_eq!(bridge.handle(&envelope, &ctx()).await, HandlerOutcome::Ok);
        assert_eq!(queue.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_dedup_key_lifted_from_payload() {
        let (queue, _) = bridged_queue(100);
        let bridge = TaskBridge::with_default_routes(queue.clone());

        let event = |_n: u32| {
            Envelope::new(
                EventStream::Contextual,
                "embedding.requested",
                json!({"asset_id": "a-1", "content_hash": "H", "dedup_key": "H"}),
            )
        };

        bridge.handle(&event(1), &ctx()).await;
        bridge.handle(&event(2), &ctx()).await;

        // Second enqueue suppressed while the first is unfinished
        assert_eq!(queue.stats().queued, 1);
    }

    #[test]
    fn test_event_types_sorted() {
        let backend = Arc::new(MemoryStreamClient::new());
        let queue = Arc::new(TaskQueue::new(backend, TaskQueueConfig::default()));
        let bridge = TaskBridge::with_default_routes(queue);
        let types = bridge.event_types();
        assert!(types.contains(&"embedding.requested".to_string()));
        assert!(types.windows(2).all(|w| w[0] <= w[1]));
    }
}
