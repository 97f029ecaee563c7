//! HLS viewer endpoints.
//!
//! GET  /api/relay/watch-input/hls/{input_name}/{file} — playlist/segments
//! POST /api/relay/hls/start-viewer                    — join as a viewer
//! POST /api/relay/hls/stop-viewer                     — leave
//! POST /api/relay/hls/heartbeat                       — keep a viewer live

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use switchboard_core::hls::{HlsError, ServeOutcome};

use crate::api::{reject_undefined, ApiError};
use crate::state::AppState;

/// Routes mounted under `/api/relay/hls`.
pub fn viewer_router() -> Router<AppState> {
    Router::new()
        .route("/start-viewer", post(start_viewer))
        .route("/stop-viewer", post(stop_viewer))
        .route("/heartbeat", post(heartbeat))
}

/// Routes mounted under `/api/relay/watch-input`.
pub fn watch_router() -> Router<AppState> {
    Router::new().route("/hls/{input_name}/{file}", get(serve_file))
}

fn map_error(e: HlsError) -> ApiError {
    let msg = e.to_string();
    match e {
        HlsError::Name(_) => ApiError::bad_request(msg),
        HlsError::Cooldown(_) => ApiError::unavailable(msg),
        HlsError::InputNotFound(_) => ApiError::not_found(msg),
        HlsError::NoPublisher(_) => ApiError::timeout(msg),
        HlsError::Input(_) | HlsError::Spawn(_) | HlsError::TempDir(_) => {
            ApiError::internal(msg)
        }
    }
}

// ── File serving ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    #[serde(rename = "viewerID")]
    pub viewer_id: Option<String>,
}

async fn serve_file(
    State(state): State<AppState>,
    Path((input_name, file)): Path<(String, String)>,
    Query(query): Query<WatchQuery>,
) -> Response {
    let outcome = state
        .hls()
        .serve(&input_name, &file, query.viewer_id.as_deref())
        .await;

    match outcome {
        ServeOutcome::Gone => (StatusCode::GONE, "viewer expired").into_response(),
        ServeOutcome::NotFound => {
            (StatusCode::NOT_FOUND, "stream not found").into_response()
        }
        ServeOutcome::NotReady => {
            (StatusCode::SERVICE_UNAVAILABLE, "stream not ready").into_response()
        }
        ServeOutcome::File {
            body,
            content_type,
            cacheable,
        } => {
            let cache_control = if cacheable {
                "public, max-age=3600"
            } else {
                "no-cache, no-store, must-revalidate"
            };
            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, cache_control),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                body,
            )
                .into_response()
        }
    }
}

// ── Viewer lifecycle ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewerRequest {
    pub input_name: String,
    #[serde(default)]
    pub viewer_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ViewerResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<String>,
}

async fn start_viewer(
    State(state): State<AppState>,
    Json(body): Json<ViewerRequest>,
) -> Result<Json<ViewerResponse>, ApiError> {
    reject_undefined("input_name", &body.input_name)?;

    let viewer_id = state
        .hls()
        .add_viewer(&body.input_name)
        .await
        .map_err(map_error)?;
    Ok(Json(ViewerResponse {
        status: "viewer started",
        viewer_id: Some(viewer_id),
    }))
}

async fn stop_viewer(
    State(state): State<AppState>,
    Json(body): Json<ViewerRequest>,
) -> Result<Json<ViewerResponse>, ApiError> {
    reject_undefined("input_name", &body.input_name)?;
    let viewer_id = body
        .viewer_id
        .ok_or_else(|| ApiError::bad_request("viewer_id is required"))?;

    state.hls().remove_viewer(&body.input_name, &viewer_id).await;
    Ok(Json(ViewerResponse {
        status: "viewer stopped",
        viewer_id: None,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(body): Json<ViewerRequest>,
) -> Result<Json<ViewerResponse>, ApiError> {
    reject_undefined("input_name", &body.input_name)?;
    let viewer_id = body
        .viewer_id
        .ok_or_else(|| ApiError::bad_request("viewer_id is required"))?;

    if !state.hls().heartbeat(&body.input_name, &viewer_id).await {
        return Err(ApiError::not_found("unknown viewer"));
    }
    Ok(Json(ViewerResponse {
        status: "ok",
        viewer_id: None,
    }))
}
