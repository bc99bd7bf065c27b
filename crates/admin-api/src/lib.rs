/*!
 * Beacon Admin API
 *
 * Small operational surface over the event bus and the task queue, plus the
 * service binary owning the lifecycle.
 *
 * ## Endpoints
 *
 * ```text
 * GET  /health                                                component health
 * GET  /ready                                                 readiness probe
 * GET  /metrics                                               prometheus text
 * GET  /streams/{stream}/info                                 XINFO STREAM
 * GET  /streams/{stream}/groups                               XINFO GROUPS
 * POST /streams/{stream}/groups/{group}/republish-dead-letters
 *      { "max_age_secs": 60 }                                 bounded replay
 * GET  /tasks/stats                                           queue statistics
 * POST /tasks/queue                                           manual enqueue
 *      { "type": "...", "payload": {...}, "priority"?, "user_id"?, "dedup_key"? }
 * ```
 *
 * Responses carry `{ success, data?, error? }`. Reads are idempotent;
 * republish is safe to repeat because every handler is idempotent on
 * replay.
 */

pub mod handlers;
pub mod response;
pub mod state;

pub use response::{ApiError, ApiResponse};
pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the admin router over shared state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics_handler))
        .route("/streams/{stream}/info", get(handlers::streams::stream_info))
        .route("/streams/{stream}/groups", get(handlers::streams::group_info))
        .route(
            "/streams/{stream}/groups/{group}/republish-dead-letters",
            post(handlers::streams::republish_dead_letters),
        )
        .route("/tasks/stats", get(handlers::tasks::task_stats))
        .route("/tasks/queue", post(handlers::tasks::queue_task))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    use beacon_bus::{BusConfig, EventBus};
    use beacon_common::stream::memory::MemoryStreamClient;
    use beacon_events::SchemaRegistry;
    use beacon_task_queue::{TaskQueue, TaskQueueConfig};

    fn test_state() -> AppState {
        let backend = Arc::new(MemoryStreamClient::new());
        let registry = Arc::new(SchemaRegistry::with_defaults());
        let bus = Arc::new(EventBus::new(
            backend.clone(),
            registry,
            BusConfig::default(),
        ));
        let tasks = Arc::new(TaskQueue::new(backend.clone(), TaskQueueConfig::default()));
        AppState {
            bus,
            tasks,
            backend,
            started_at: chrono::Utc::now(),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_components() {
        let router = build_router(test_state());
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["checks"]["backend"], "ok");
    }

    #[tokio::test]
    async fn test_stream_info_known_and_unknown() {
        let router = build_router(test_state());

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/streams/user.events/info")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["length"], 0);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/streams/billing.events/info")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "UNKNOWN_STREAM");
    }

    #[tokio::test]
    async fn test_dead_sibling_accepted_for_introspection() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/streams/ai.events.dead/info")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_manual_enqueue_and_stats() {
        use async_trait::async_trait;
        use beacon_task_queue::{Task, TaskHandler, TaskOutcome};
        use tokio_util::sync::CancellationToken;

        struct NoopHandler;

        #[async_trait]
        impl TaskHandler for NoopHandler {
            async fn execute(&self, _: &Task, _: CancellationToken) -> TaskOutcome {
                TaskOutcome::Ok
            }
        }

        let state = test_state();
        state
            .tasks
            .register_handler("embed.asset", Arc::new(NoopHandler))
            .unwrap();
        let router = build_router(state);

        // Unknown type rejected with a structured error
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks/queue")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({"type": "never.registered", "payload": {}}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        // Known type enqueues
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks/queue")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({
                            "type": "embed.asset",
                            "payload": {"asset_id": "a-1"},
                            "priority": "high",
                            "dedup_key": "a-1",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["deduplicated"], false);

        // Duplicate suppressed, same id returned
        let first_id = body["data"]["task_id"].clone();
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks/queue")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({
                            "type": "embed.asset",
                            "payload": {"asset_id": "a-1"},
                            "dedup_key": "a-1",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["deduplicated"], true);
        assert_eq!(body["data"]["task_id"], first_id);

        // Stats reflect the backlog
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/tasks/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["queued"], 1);
    }

    #[tokio::test]
    async fn test_republish_on_empty_dead_stream() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/streams/user.events/groups/users/republish-dead-letters")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json!({"max_age_secs": 60}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["republished"], 0);
    }
}
