//! Recording endpoints.
//!
//! POST /api/recording/start     — start recording a source
//! POST /api/recording/stop      — stop the latest active recording
//! POST /api/recording/delete    — delete a finished recording
//! GET  /api/recording/list      — memory ∪ disk listing
//! GET  /api/recording/download  — stream an MP4 file
//! GET  /api/recording/sse       — change-notification event stream

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use switchboard_core::recording::{RecordingError, StopOutcome};

use crate::api::{reject_undefined, ApiError};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/delete", post(delete))
        .route("/list", get(list))
        .route("/download", get(download))
        .route("/sse", get(sse))
}

fn map_error(e: RecordingError) -> ApiError {
    let msg = e.to_string();
    match e {
        RecordingError::AlreadyExists { .. } => ApiError::conflict(msg),
        RecordingError::NotFound => ApiError::not_found(msg),
        RecordingError::ActiveRecording => ApiError::conflict(msg),
        RecordingError::Name(_) => ApiError::bad_request(msg),
        RecordingError::InputNotReady(_) => ApiError::timeout(msg),
        RecordingError::Input(_)
        | RecordingError::Spawn(_)
        | RecordingError::Io { .. } => ApiError::internal(msg),
    }
}

// ── Start / stop / delete ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingRequest {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Serialize)]
pub struct RecordingResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

async fn start(
    State(state): State<AppState>,
    Json(body): Json<RecordingRequest>,
) -> Result<Json<RecordingResponse>, ApiError> {
    reject_undefined("name", &body.name)?;
    reject_undefined("source", &body.source)?;

    let key = state
        .recordings()
        .start(&body.name, &body.source)
        .await
        .map_err(map_error)?;
    Ok(Json(RecordingResponse {
        status: "recording started".into(),
        key: Some(key),
    }))
}

async fn stop(
    State(state): State<AppState>,
    Json(body): Json<RecordingRequest>,
) -> Result<Json<RecordingResponse>, ApiError> {
    reject_undefined("name", &body.name)?;
    reject_undefined("source", &body.source)?;

    let outcome = state
        .recordings()
        .stop(&body.name, &body.source)
        .await
        .map_err(map_error)?;
    let status = match outcome {
        StopOutcome::Stopping => "recording stopping",
        StopOutcome::AlreadyFinished => "recording already finished",
    };
    Ok(Json(RecordingResponse {
        status: status.into(),
        key: None,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteRequest {
    pub filename: String,
}

async fn delete(
    State(state): State<AppState>,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<RecordingResponse>, ApiError> {
    reject_undefined("filename", &body.filename)?;

    state
        .recordings()
        .delete(&body.filename)
        .await
        .map_err(map_error)?;
    Ok(Json(RecordingResponse {
        status: "recording deleted".into(),
        key: None,
    }))
}

// ── Listing / download ──────────────────────────────────────────────

async fn list(
    State(state): State<AppState>,
) -> Json<Vec<switchboard_core::recording::Recording>> {
    Json(state.recordings().list().await)
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub filename: String,
}

/// Stream the MP4 without buffering it whole; the path has already been
/// validated against traversal and suffix by the manager.
async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let path = state
        .recordings()
        .download_path(&query.filename)
        .ok_or_else(|| ApiError::not_found("recording file not found"))?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| ApiError::internal(format!("failed to open recording: {e}")))?;

    let stream = async_stream::stream! {
        let mut file = file;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok::<_, std::io::Error>(
                    axum::body::Bytes::copy_from_slice(&buf[..n]),
                ),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", query.filename),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(response)
}

// ── Event stream ────────────────────────────────────────────────────

/// Unsubscribes its broker registration when the SSE stream is dropped.
struct SubscriptionGuard {
    state: AppState,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.state.events().unsubscribe(self.id);
    }
}

/// Server-sent "update" edges from the event broker. The stream ends when
/// the broker shuts down (its channel closes).
async fn sse(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut sub = state.events().subscribe();
    let guard = SubscriptionGuard {
        state: state.clone(),
        id: sub.id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(msg) = sub.rx.recv().await {
            yield Ok(Event::default().data(msg));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
