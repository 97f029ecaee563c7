//! Relay management endpoints.
//!
//! POST /api/relay/start         — declare and start a relay
//! POST /api/relay/stop          — stop one relay leg
//! POST /api/relay/delete-input  — delete an input and all its outputs
//! POST /api/relay/delete-output — delete one output
//! GET  /api/relay/status        — full status snapshot
//! GET  /api/relay/export        — declaration set as JSON
//! POST /api/relay/import        — replace the declaration set
//! GET  /api/relay/presets       — platform preset table

use std::collections::HashMap;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use switchboard_common::presets;
use switchboard_common::EncoderOptions;
use switchboard_core::coordinator::CoordinatorError;
use switchboard_core::input::InputError;
use switchboard_core::source::SourceError;
use switchboard_core::RelayDeclaration;

use crate::api::{reject_undefined, ApiError};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start_relay))
        .route("/stop", post(stop_relay))
        .route("/delete-input", post(delete_input))
        .route("/delete-output", post(delete_output))
        .route("/status", get(status))
        .route("/export", get(export))
        .route("/import", post(import))
        .route("/presets", get(list_presets))
        .nest("/hls", super::hls::viewer_router())
        .nest("/watch-input", super::hls::watch_router())
}

fn map_error(e: CoordinatorError) -> ApiError {
    let msg = e.to_string();
    match e {
        CoordinatorError::Preset(_) => ApiError::bad_request(msg),
        CoordinatorError::Input(InputError::Source(src)) => match src {
            SourceError::NotFound(_) => ApiError::not_found(msg),
            _ => ApiError::bad_request(msg),
        },
        CoordinatorError::Input(_) => ApiError::internal(msg),
        CoordinatorError::InputNotReady { .. } => ApiError::timeout(msg),
        CoordinatorError::Output(_) => ApiError::internal(msg),
        CoordinatorError::UnknownRelay(_) => ApiError::not_found(msg),
        CoordinatorError::ImportRead { .. }
        | CoordinatorError::ImportParse { .. }
        | CoordinatorError::ExportWrite { .. } => ApiError::internal(msg),
    }
}

// ── Start / Stop ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartRelayRequest {
    pub input_url: String,
    pub output_url: String,
    pub input_name: String,
    pub output_name: String,
    #[serde(default)]
    pub platform_preset: Option<String>,
    #[serde(default)]
    pub ffmpeg_options: Option<EncoderOptions>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub status: &'static str,
}

async fn start_relay(
    State(state): State<AppState>,
    Json(body): Json<StartRelayRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    reject_undefined("input_url", &body.input_url)?;
    reject_undefined("output_url", &body.output_url)?;
    reject_undefined("input_name", &body.input_name)?;
    reject_undefined("output_name", &body.output_name)?;

    let decl = RelayDeclaration {
        input_url: body.input_url,
        output_url: body.output_url,
        input_name: body.input_name,
        output_name: body.output_name,
        platform_preset: body.platform_preset,
        ffmpeg_options: body.ffmpeg_options,
    };
    state
        .coordinator()
        .start_relay(decl)
        .await
        .map_err(map_error)?;
    Ok(Json(OkResponse {
        status: "relay started",
    }))
}

async fn stop_relay(
    State(state): State<AppState>,
    Json(body): Json<StartRelayRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    reject_undefined("input_url", &body.input_url)?;
    reject_undefined("output_url", &body.output_url)?;
    reject_undefined("input_name", &body.input_name)?;
    reject_undefined("output_name", &body.output_name)?;

    state
        .coordinator()
        .stop_relay(&body.input_url, &body.output_url)
        .await
        .map_err(map_error)?;
    Ok(Json(OkResponse {
        status: "relay stopped",
    }))
}

// ── Delete ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteInputRequest {
    pub input_url: String,
    pub input_name: String,
}

async fn delete_input(
    State(state): State<AppState>,
    Json(body): Json<DeleteInputRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    reject_undefined("input_url", &body.input_url)?;
    reject_undefined("input_name", &body.input_name)?;

    state
        .coordinator()
        .delete_input(&body.input_url)
        .await
        .map_err(map_error)?;
    Ok(Json(OkResponse {
        status: "input deleted",
    }))
}

async fn delete_output(
    State(state): State<AppState>,
    Json(body): Json<StartRelayRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    reject_undefined("output_url", &body.output_url)?;

    state
        .coordinator()
        .delete_output(&body.output_url)
        .await
        .map_err(map_error)?;
    Ok(Json(OkResponse {
        status: "output deleted",
    }))
}

// ── Status / declarations / presets ─────────────────────────────────

async fn status(
    State(state): State<AppState>,
) -> Json<switchboard_core::StatusReport> {
    Json(state.coordinator().status().await)
}

async fn export(
    State(state): State<AppState>,
) -> Json<HashMap<String, RelayDeclaration>> {
    Json(state.coordinator().declarations().await)
}

async fn import(
    State(state): State<AppState>,
    Json(decls): Json<HashMap<String, RelayDeclaration>>,
) -> Json<OkResponse> {
    state.coordinator().replace_declarations(decls).await;
    Json(OkResponse {
        status: "declarations imported",
    })
}

async fn list_presets() -> Json<serde_json::Value> {
    Json(serde_json::to_value(presets::all()).expect("preset table serializes"))
}
