//! REST API route tree.

pub mod hls;
pub mod recording;
pub mod relay;
pub mod rtsp;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// JSON bodies above this size are rejected outright.
const BODY_LIMIT: usize = 1024 * 1024;

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/relay", relay::router())
        .nest("/recording", recording::router())
        .nest("/rtsp", rtsp::router())
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
}

// ── Error type ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: msg.into(),
        }
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// The web UI sends the string "undefined" when a field was never set;
/// treat it as absent rather than letting it become a name on disk.
pub fn reject_undefined(field: &str, value: &str) -> Result<(), ApiError> {
    if value == "undefined" || value.is_empty() {
        return Err(ApiError::bad_request(format!("{field} is required")));
    }
    Ok(())
}
