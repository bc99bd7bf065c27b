//! Stream introspection and dead-letter republish

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use beacon_events::EventStream;

use crate::response::{error_response, ApiResponse};
use crate::state::AppState;

/// Accepts a named stream or its `.dead` sibling; anything else is unknown.
fn resolve_stream_name(raw: &str) -> Option<String> {
    let base = raw.strip_suffix(".dead").unwrap_or(raw);
    base.parse::<EventStream>().ok().map(|_| raw.to_string())
}

fn unknown_stream(raw: &str) -> Response {
    ApiResponse::error(
        StatusCode::NOT_FOUND,
        "UNKNOWN_STREAM",
        format!("'{raw}' is not a named stream"),
    )
}

/// GET /streams/{stream}/info
pub async fn stream_info(
    State(state): State<AppState>,
    Path(stream): Path<String>,
) -> Response {
    let Some(stream) = resolve_stream_name(&stream) else {
        return unknown_stream(&stream);
    };

    match state.bus.stream_info(&stream).await {
        Ok(info) => ApiResponse::ok(json!({
            "stream": info.name,
            "length": info.length,
            "first_id": info.first_id,
            "last_id": info.last_id,
            "groups": info.groups,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /streams/{stream}/groups
pub async fn group_info(
    State(state): State<AppState>,
    Path(stream): Path<String>,
) -> Response {
    let Some(stream) = resolve_stream_name(&stream) else {
        return unknown_stream(&stream);
    };

    match state.bus.group_info(&stream).await {
        Ok(groups) => {
            let rows: Vec<_> = groups
                .into_iter()
                .map(|g| {
                    json!({
                        "name": g.name,
                        "consumers": g.consumers,
                        "pending": g.pending,
                        "last_delivered_id": g.last_delivered_id,
                    })
                })
                .collect();
            ApiResponse::ok(json!({ "stream": stream, "groups": rows })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RepublishRequest {
    pub max_age_secs: u64,
}

/// POST /streams/{stream}/groups/{group}/republish-dead-letters
pub async fn republish_dead_letters(
    State(state): State<AppState>,
    Path((stream, group)): Path<(String, String)>,
    axum::Json(request): axum::Json<RepublishRequest>,
) -> Response {
    let Ok(stream) = stream.parse::<EventStream>() else {
        return unknown_stream(&stream);
    };

    match state
        .bus
        .republish_dead_letters(stream, &group, Duration::from_secs(request.max_age_secs))
        .await
    {
        Ok(republished) => {
            ApiResponse::ok(json!({ "republished": republished })).into_response()
        }
        Err(e) => error_response(&e),
    }
}
