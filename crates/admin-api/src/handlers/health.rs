//! Health and readiness probes

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use beacon_common::stream::StreamBackend;

use crate::state::AppState;

/// Component-by-component health. 503 once any component degrades.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let backend_healthy = state.backend.ping().await.is_ok();
    let subscriptions = state.bus.subscription_health().await;
    let consumers_healthy = subscriptions.iter().all(|s| s.status == "running");
    let task_stats = state.tasks.stats();

    let healthy = backend_healthy && consumers_healthy;
    let status = if healthy { "healthy" } else { "degraded" };

    let body = json!({
        "status": status,
        "service": "beacon-admin",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
        "checks": {
            "backend": if backend_healthy { "ok" } else { "failed" },
            "consumers": subscriptions,
            "tasks": {
                "running": task_stats.running,
                "queued": task_stats.queued,
                "dead_total": task_stats.dead_total,
            },
        }
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Readiness probe: can this process serve traffic right now?
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let backend_ready = state.backend.ping().await.is_ok();
    let consumers_ready = state.bus.all_consumers_running().await;
    let ready = backend_ready && consumers_ready;

    let body = json!({
        "ready": ready,
        "service": "beacon-admin",
        "checks": {
            "backend": backend_ready,
            "consumers": consumers_ready,
        }
    });

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Prometheus metrics in text exposition format.
pub async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
