//! Task queue stats and manual enqueue

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use beacon_task_queue::TaskSpec;

use crate::response::{error_response, ApiResponse};
use crate::state::AppState;

/// GET /tasks/stats
pub async fn task_stats(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.tasks.stats()).into_response()
}

/// POST /tasks/queue
///
/// Manual enqueue for operators and backfills. Dedup-key collisions come
/// back as a success carrying the existing task id.
pub async fn queue_task(
    State(state): State<AppState>,
    axum::Json(spec): axum::Json<TaskSpec>,
) -> Response {
    match state.tasks.queue_task(spec) {
        Ok(outcome) => ApiResponse::ok(json!({
            "task_id": outcome.id,
            "deduplicated": outcome.deduplicated,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}
