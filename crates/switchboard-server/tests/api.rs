//! HTTP surface tests — drive the router directly with `tower::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use switchboard_core::test_support::{fake_publisher, stub_encoder_script};
use switchboard_core::{
    Coordinator, EventBroker, HlsManager, InputRegistry, OutputRegistry,
    RecordingManager, RtspServer, TaskGroup,
};
use switchboard_server::{api, state::AppState};

struct TestApp {
    app: Router,
    rtsp: Arc<RtspServer>,
    dir: tempfile::TempDir,
}

async fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = stub_encoder_script(
        dir.path(),
        "eval \"out=\\${$#}\"\n\
         printf 'data' > \"$out\" 2>/dev/null\n\
         trap 'exit 0' INT TERM\n\
         while :; do sleep 1; done\n",
    );
    let tasks = TaskGroup::new();
    let rtsp = RtspServer::bind("127.0.0.1:0", &tasks).await.unwrap();
    let inputs = Arc::new(InputRegistry::new(
        rtsp.clone(),
        rtsp.local_addr().to_string(),
        dir.path().to_path_buf(),
        ffmpeg.clone(),
        tasks.clone(),
    ));
    let outputs = Arc::new(OutputRegistry::new(ffmpeg.clone(), tasks.clone()));
    let coordinator = Coordinator::new(
        inputs.clone(),
        outputs,
        rtsp.clone(),
        Duration::from_secs(5),
        &tasks,
    );
    let events = Arc::new(EventBroker::new());
    let recordings = RecordingManager::new(
        inputs.clone(),
        rtsp.clone(),
        dir.path().to_path_buf(),
        ffmpeg.clone(),
        events.clone(),
        tasks.clone(),
        Duration::from_secs(5),
    );
    let hls = HlsManager::new(
        inputs,
        rtsp.clone(),
        ffmpeg,
        tasks,
        Duration::from_secs(300),
        Duration::from_secs(120),
        Duration::from_secs(2),
    );

    let state = AppState::new(coordinator, recordings, hls, rtsp.clone(), events);
    let app = Router::new().nest("/api", api::router()).with_state(state);
    TestApp { app, rtsp, dir }
}

async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post(app: &Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn status_starts_empty() {
    let t = test_app().await;
    let (status, json) = get(&t.app, "/api/relay/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["inputs"], serde_json::json!([]));
    assert_eq!(json["outputs"], serde_json::json!([]));
    assert!(json["processes"].as_array().is_some());
}

#[tokio::test]
async fn presets_table_is_served() {
    let t = test_app().await;
    let (status, json) = get(&t.app, "/api/relay/presets").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["youtube"]["video_codec"], "libx264");
    assert!(json["copy"].is_object());
}

#[tokio::test]
async fn undefined_literals_are_rejected() {
    let t = test_app().await;
    let (status, json) = post(
        &t.app,
        "/api/relay/start",
        r#"{"input_url":"rtsp://a/x","output_url":"rtmp://b/live",
            "input_name":"undefined","output_name":"b1"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("input_name"));

    let (status, _) = post(
        &t.app,
        "/api/recording/start",
        r#"{"name":"undefined","source":"rtsp://a/x"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_json_fields_are_rejected() {
    let t = test_app().await;
    let (status, _) = post(
        &t.app,
        "/api/recording/start",
        r#"{"name":"cam","source":"rtsp://a/x","bogus":true}"#,
    )
    .await;
    assert!(status.is_client_error(), "got {status}");
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let t = test_app().await;
    let huge = format!(
        r#"{{"name":"cam","source":"{}"}}"#,
        "x".repeat(1024 * 1024 + 64)
    );
    let (status, _) = post(&t.app, "/api/recording/start", &huge).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn download_refuses_traversal_and_wrong_suffix() {
    let t = test_app().await;
    std::fs::write(t.dir.path().join("clip_1.mp4"), b"mp4data").unwrap();

    let (status, _) = get(
        &t.app,
        "/api/recording/download?filename=..%2Fclip_1.mp4",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&t.app, "/api/recording/download?filename=clip_1.txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The legitimate file downloads.
    let response = t
        .app
        .clone()
        .oneshot(
            Request::get("/api/recording/download?filename=clip_1.mp4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "video/mp4"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"mp4data");
}

#[tokio::test]
async fn recording_list_merges_disk_files() {
    let t = test_app().await;
    std::fs::write(t.dir.path().join("old_1700000000.mp4"), b"x").unwrap();

    let (status, json) = get(&t.app, "/api/recording/list").await;
    assert_eq!(status, StatusCode::OK);
    let list = json.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["name"], "old");
    assert_eq!(list[0]["active"], false);
}

#[tokio::test]
async fn rtsp_status_lists_streams() {
    let t = test_app().await;
    let (status, json) = get(&t.app, "/api/rtsp/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, serde_json::json!([]));

    let _pub = fake_publisher(t.rtsp.local_addr(), "relay/cam").await;
    let (status, json) = get(&t.app, "/api/rtsp/status").await;
    assert_eq!(status, StatusCode::OK);
    let streams = json.as_array().unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0]["path"], "relay/cam");
    assert_eq!(streams[0]["ready"], true);
}

#[tokio::test]
async fn export_import_round_trip_over_http() {
    let t = test_app().await;
    let decls = r#"{
        "rtsp://a/x|rtmp://b/live": {
            "input_url": "rtsp://a/x",
            "output_url": "rtmp://b/live",
            "input_name": "x",
            "output_name": "b1",
            "platform_preset": "twitch"
        }
    }"#;
    let (status, _) = post(&t.app, "/api/relay/import", decls).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = get(&t.app, "/api/relay/export").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json["rtsp://a/x|rtmp://b/live"]["platform_preset"],
        "twitch"
    );
}

#[tokio::test]
async fn relay_start_flow_over_http() {
    let t = test_app().await;
    let _pub = fake_publisher(t.rtsp.local_addr(), "relay/x").await;

    let (status, json) = post(
        &t.app,
        "/api/relay/start",
        r#"{"input_url":"rtsp://a/x","output_url":"rtmp://b/live",
            "input_name":"x","output_name":"b1"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["status"], "relay started");

    let (_, json) = get(&t.app, "/api/relay/status").await;
    assert_eq!(json["inputs"][0]["refcount"], 1);
    assert_eq!(json["inputs"][0]["state"], "running");
    assert_eq!(json["outputs"][0]["output_url"], "rtmp://b/live");

    let (status, _) = post(
        &t.app,
        "/api/relay/stop",
        r#"{"input_url":"rtsp://a/x","output_url":"rtmp://b/live",
            "input_name":"x","output_name":"b1"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = get(&t.app, "/api/relay/status").await;
    assert_eq!(json["inputs"][0]["refcount"], 0);
}

#[tokio::test]
async fn hls_endpoints_handle_missing_sessions() {
    let t = test_app().await;

    let (status, _) = get(&t.app, "/api/relay/watch-input/hls/ghost/index.m3u8").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(
        &t.app,
        "/api/relay/hls/heartbeat",
        r#"{"input_name":"ghost","viewer_id":"viewer_1_ghost"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Unknown input name for a viewer join.
    let (status, _) = post(
        &t.app,
        "/api/relay/hls/start-viewer",
        r#"{"input_name":"ghost"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Bad names are rejected outright (URL-encoded traversal).
    let (status, _) = post(
        &t.app,
        "/api/relay/hls/start-viewer",
        r#"{"input_name":"a/../b"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
