/*!
 * Beacon Service
 *
 * Hosts the event backbone: stream backend connection, event bus, task
 * queue and the admin surface, wired together as explicit dependencies.
 *
 * ## Lifecycle
 *
 * ```text
 * connect -> ensure base groups -> start queue + subscriptions -> serve
 *    ... Ctrl+C ...
 * stop intake -> drain consumers -> drain workers (grace) -> persist -> exit
 * ```
 *
 * Startup refuses to serve until the stream backend answers PING. Shutdown
 * lets in-flight handlers finish within the grace period, then
 * force-cancels; un-ACKed entries stay pending for the replacement process.
 *
 * ## Configuration
 *
 * Environment variables (see `beacon-config` for the full list):
 * - REDIS_HOST / REDIS_PORT / REDIS_PASSWORD / REDIS_DB
 * - CONSUMER_GROUP_PREFIX, CONSUMER_BLOCK_TIME_MS, CONSUMER_CLAIM_IDLE_TIME_MS
 * - STREAM_MAX_RETRIES, STREAM_MAX_LENGTH
 * - TASK_MAX_CONCURRENT, TASK_HANDLER_TIMEOUT_MS
 * - ADMIN_HOST / ADMIN_PORT
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use beacon_admin_api::{build_router, AppState};
use beacon_bus::{BusConfig, EventBus, SubscribeOptions};
use beacon_common::stream::{GroupStart, RedisStreamClient, StreamBackend};
use beacon_config::Config;
use beacon_events::{EventStream, SchemaRegistry};
use beacon_task_queue::{TaskBridge, TaskQueue, TaskQueueConfig, DEFAULT_ROUTES};

/// Drain window for consumers and workers on shutdown
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Registration point for the embedding application's task handlers.
///
/// The standalone service ships none: domain handlers (embeddings, content
/// generation, notifications) live with their services and register here
/// when they embed the backbone as a library. Returns the handled task
/// types so only their events get bridged.
fn register_task_handlers(_tasks: &TaskQueue) -> Result<Vec<&'static str>> {
    Ok(Vec::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    beacon_common::init_tracing();

    info!("🚀 Starting Beacon event backbone");

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("📋 Configuration loaded:");
    info!("   - Redis: {}:{}/{}", config.redis.host, config.redis.port, config.redis.db);
    info!("   - Group prefix: {}", config.consumers.group_prefix);
    info!(
        "   - Streams: max_retries={} max_length={}",
        config.streams.max_retries, config.streams.max_length
    );
    info!(
        "   - Consumers: block={}ms claim_idle={}ms batch={}",
        config.consumers.block_time_ms,
        config.consumers.claim_idle_time_ms,
        config.consumers.batch_size
    );
    info!(
        "   - Tasks: workers={} max_queued={} timeout={}ms",
        config.tasks.max_concurrent, config.tasks.max_queued, config.tasks.handler_timeout_ms
    );
    info!("   - Admin: {}:{}", config.admin.host, config.admin.port);

    // Refuse to serve until the backend responds
    info!("📡 Connecting to stream backend...");
    let client = RedisStreamClient::connect(&config.redis.url())
        .await
        .context("Failed to connect to the stream backend")?;
    client
        .ping()
        .await
        .context("Stream backend did not answer PING")?;
    let backend: Arc<dyn StreamBackend> = Arc::new(client);

    // Base groups: creates every stream and its dead-letter sibling so
    // introspection works on a fresh backend
    info!("🔧 Ensuring base consumer groups...");
    let ops_group = format!("{}.ops", config.consumers.group_prefix);
    for stream in EventStream::all() {
        backend
            .ensure_group(stream.as_str(), &ops_group, GroupStart::NewOnly)
            .await
            .context("Failed to ensure base group")?;
        backend
            .ensure_group(&stream.dead_letter_name(), &ops_group, GroupStart::NewOnly)
            .await
            .context("Failed to ensure dead-letter base group")?;
    }
    info!("✅ Base consumer groups ready");

    let registry = Arc::new(SchemaRegistry::with_defaults());
    let bus = Arc::new(EventBus::new(
        Arc::clone(&backend),
        Arc::clone(&registry),
        BusConfig::from_config(&config),
    ));
    let tasks = Arc::new(TaskQueue::new(
        Arc::clone(&backend),
        TaskQueueConfig::from_config(&config),
    ));

    let handled = register_task_handlers(&tasks).context("Failed to register task handlers")?;
    tasks.start().await.map_err(anyhow::Error::new)?;

    // Bridge only the event types whose task handlers exist
    let routes: Vec<(&str, &str)> = DEFAULT_ROUTES
        .iter()
        .copied()
        .filter(|(_, task_type)| handled.contains(task_type))
        .collect();

    let mut subscriptions = Vec::new();
    if routes.is_empty() {
        info!("ℹ️  No task handlers registered; running as backbone and admin surface only");
    } else {
        let bridge = Arc::new(
            routes
                .iter()
                .fold(TaskBridge::new(Arc::clone(&tasks)), |b, (event, task)| {
                    b.route(*event, *task)
                }),
        );

        // Group routed event types by the stream their schema lives on
        let mut per_stream: HashMap<EventStream, Vec<String>> = HashMap::new();
        for (event_type, _) in &routes {
            match registry.stream_of(event_type, 1) {
                Some(stream) => per_stream
                    .entry(stream)
                    .or_default()
                    .push((*event_type).to_string()),
                None => warn!(event_type, "Routed event type missing from the registry"),
            }
        }

        for (stream, filter_types) in per_stream {
            let handle = bus
                .subscribe(
                    stream,
                    "tasks",
                    Arc::clone(&bridge) as Arc<dyn beacon_bus::EventHandler>,
                    SubscribeOptions {
                        filter_types: Some(filter_types),
                        ..Default::default()
                    },
                )
                .await
                .map_err(anyhow::Error::new)?;
            subscriptions.push(handle);
        }
        info!(
            subscriptions = subscriptions.len(),
            "✅ Task bridge subscribed"
        );
    }

    // Admin surface
    let state = AppState {
        bus: Arc::clone(&bus),
        tasks: Arc::clone(&tasks),
        backend: Arc::clone(&backend),
        started_at: chrono::Utc::now(),
    };
    let router = build_router(state);
    let addr = format!("{}:{}", config.admin.host, config.admin.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind admin server to {addr}"))?;

    info!("🏥 Admin server listening on http://{}", addr);
    info!("   - GET  /health, /ready, /metrics");
    info!("   - GET  /streams/{{stream}}/info, /streams/{{stream}}/groups");
    info!("   - POST /streams/{{stream}}/groups/{{group}}/republish-dead-letters");
    info!("   - GET  /tasks/stats | POST /tasks/queue");
    info!("   - Press Ctrl+C to shutdown gracefully");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Admin server failed: {}", e);
        }
    });

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("📡 Received Ctrl+C signal");
    info!("🛑 Shutting down Beacon...");

    // Consumers first so no new tasks arrive, then drain the workers
    bus.shutdown().await;
    tasks.stop(DRAIN_GRACE).await;
    server.abort();

    info!("👋 Beacon stopped");
    Ok(())
}
