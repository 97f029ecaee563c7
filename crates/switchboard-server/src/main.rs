//! switchboard — live-video relay supervisor.
//!
//! Single binary that runs:
//! - the embedded RTSP republisher
//! - the input/output relay registries and coordinator
//! - the recording and HLS session managers
//! - the HTTP/JSON control API (+ SSE event stream, static UI fallback)
//!
//! Teardown on SIGINT/SIGTERM is ordered and deadline-bounded so no child
//! encoder and no application task outlives the supervisor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use switchboard_common::Config;
use switchboard_core::{
    Coordinator, EventBroker, HlsManager, InputRegistry, OutputRegistry,
    RecordingManager, RtspServer, TaskGroup,
};
use switchboard_server::{api, state::AppState};

/// Bound on waiting for in-flight HTTP requests (SSE included) to drain.
const HTTP_DRAIN: Duration = Duration::from_secs(30);
/// Grace after endlisting playlists so players fetch the final playlist.
const ENDLIST_GRACE: Duration = Duration::from_secs(15);
/// Settle delay before the final task report.
const SETTLE: Duration = Duration::from_secs(3);
/// HLS session defaults.
const HLS_SESSION_TIMEOUT: Duration = Duration::from_secs(300);
const HLS_CLEANUP_INTERVAL: Duration = Duration::from_secs(120);
const HLS_PUBLISHER_WAIT: Duration = Duration::from_secs(5);

/// switchboard relay supervisor daemon.
#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Live-video relay supervisor")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "config.json")]
    config: String,

    /// Override the recordings directory from the config file.
    #[arg(long)]
    recordings_dir: Option<String>,

    /// Encoder binary to spawn for every media leg.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_tracing(&config)?;

    let recordings_dir = cli
        .recordings_dir
        .unwrap_or_else(|| config.recording.directory.clone());
    std::fs::create_dir_all(&recordings_dir)
        .with_context(|| format!("cannot create recordings dir {recordings_dir}"))?;
    std::fs::read_dir(&recordings_dir)
        .with_context(|| format!("recordings dir {recordings_dir} is not readable"))?;

    tracing::info!(
        config = %cli.config,
        recordings_dir = %recordings_dir,
        ffmpeg = %cli.ffmpeg_path,
        "switchboard starting"
    );

    // ── Boot: RTSP → registries → coordinator → managers → HTTP ────
    let tasks = TaskGroup::new();

    let rtsp = RtspServer::bind(&config.relay.rtsp_server.bind_addr(), &tasks)
        .await
        .context("rtsp server failed to start")?;

    let inputs = Arc::new(InputRegistry::new(
        rtsp.clone(),
        config.relay.rtsp_server.bind_addr(),
        recordings_dir.clone().into(),
        cli.ffmpeg_path.clone(),
        tasks.clone(),
    ));
    let outputs = Arc::new(OutputRegistry::new(cli.ffmpeg_path.clone(), tasks.clone()));
    let coordinator = Coordinator::new(
        inputs.clone(),
        outputs,
        rtsp.clone(),
        config.relay.input_timeout(),
        &tasks,
    );

    let events = Arc::new(EventBroker::new());
    let recordings = RecordingManager::new(
        inputs.clone(),
        rtsp.clone(),
        recordings_dir.into(),
        cli.ffmpeg_path.clone(),
        events.clone(),
        tasks.clone(),
        config.relay.input_timeout(),
    );
    let hls = HlsManager::new(
        inputs,
        rtsp.clone(),
        cli.ffmpeg_path,
        tasks.clone(),
        HLS_SESSION_TIMEOUT,
        HLS_CLEANUP_INTERVAL,
        HLS_PUBLISHER_WAIT,
    );

    let state = AppState::new(
        coordinator.clone(),
        recordings.clone(),
        hls.clone(),
        rtsp.clone(),
        events,
    );

    // TODO: wire http read/idle timeouts through hyper's builder once
    // axum::serve exposes them.
    let app = Router::new()
        .nest("/api", api::router())
        .fallback_service(ServeDir::new("ui"))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind http server on {addr}"))?;
    tracing::info!(%addr, "http server listening");

    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = drain_rx.await;
    });
    let server_task = tokio::spawn(async move { server.await });

    // ── Wait for a termination signal ───────────────────────────────
    shutdown_signal().await;
    tracing::info!("termination signal received, shutting down");

    // 1. Stop accepting requests, drain in-flight ones (bounded).
    let _ = drain_tx.send(());
    match tokio::time::timeout(HTTP_DRAIN, server_task).await {
        Ok(joined) => {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "http server task failed");
            }
        }
        Err(_) => tracing::warn!("http drain timed out, proceeding"),
    }

    // 2. Let connected players see a clean end of stream.
    hls.write_endlist_to_all().await;
    tokio::time::sleep(ENDLIST_GRACE).await;

    // 3–6. Managers in reverse boot order, then the RTSP server.
    hls.shutdown().await;
    recordings.shutdown().await;
    coordinator.stop_all_relays().await;
    rtsp.stop();

    // 7. Settle, then account for stragglers.
    tokio::time::sleep(SETTLE).await;
    tasks.report();

    tracing::info!("switchboard stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation");
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate.recv() => {}
    }
}

/// Logging: `RUST_LOG` wins, then `SWITCHBOARD_DEBUG=1`, then the config
/// level. An optional log file receives the same stream without ANSI.
fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let default_level = if std::env::var("SWITCHBOARD_DEBUG").as_deref() == Ok("1") {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
