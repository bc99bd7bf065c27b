//! Response envelope
//!
//! Every admin endpoint answers `{ success, data?, error? }` with a
//! structured `{ code, message }` error body, so callers never parse
//! free-form strings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

impl ApiResponse<serde_json::Value> {
    pub fn error(
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Response {
        let body = Json(Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
        });
        (status, body).into_response()
    }
}

/// Map a core error onto the admin wire contract.
pub fn error_response(e: &beacon_common::Error) -> Response {
    use beacon_common::Error;
    match e {
        Error::Validation(message) => ApiResponse::error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            message.clone(),
        ),
        Error::Saturated(message) => {
            ApiResponse::error(StatusCode::SERVICE_UNAVAILABLE, "SATURATED", message.clone())
        }
        Error::BackendUnavailable(message) => ApiResponse::error(
            StatusCode::SERVICE_UNAVAILABLE,
            "BACKEND_UNAVAILABLE",
            message.clone(),
        ),
        other => ApiResponse::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            other.to_string(),
        ),
    }
}
