//! RTSP republisher status.
//!
//! GET /api/rtsp/status — the list of published paths with reader counts.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use switchboard_core::rtsp::RtspStreamInfo;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(status))
}

async fn status(State(state): State<AppState>) -> Json<Vec<RtspStreamInfo>> {
    Json(state.rtsp().streams_info())
}
