//! HLS session manager — browser-watchable materializations of inputs.
//!
//! A session transcodes one input relay into a rolling on-disk HLS playlist
//! inside a private temp directory. Sessions are keyed by input name,
//! created idempotently on first request, kept alive by viewer heartbeats,
//! and reaped by the eviction loop once idle. An input that recently failed
//! to materialize is put on a short cooldown so a reloading player cannot
//! hammer a dead source with encoder spawns.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::Watcher;
use tokio::sync::{watch, Mutex};

use crate::ffmpeg::FfmpegHandle;
use crate::input::{InputError, InputRegistry};
use crate::rtsp::RtspServer;
use crate::source;
use crate::tasks::TaskGroup;

/// A viewer with no heartbeat for this long is stale.
const VIEWER_TIMEOUT: Duration = Duration::from_secs(30);
/// Failed inputs are refused for this long.
const FAILURE_COOLDOWN: Duration = Duration::from_secs(30);
/// Cap on the playlist readiness wait.
const READY_CAP: Duration = Duration::from_secs(10);
/// Polling fallback for readiness: 50 × 200 ms.
const READY_POLL: Duration = Duration::from_millis(200);
const READY_POLL_ROUNDS: u32 = 50;
/// Serve-side wait for a session that exists but is not ready yet.
const SERVE_READY_WAIT: Duration = Duration::from_secs(5);
const SERVE_READY_POLL: Duration = Duration::from_millis(200);
/// Open retry papering over the encoder's write-then-rename race.
const OPEN_RETRIES: u32 = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);
/// "input not found" warnings are limited to one per name per window.
const WARN_WINDOW: Duration = Duration::from_secs(10);
/// Encoder stop grace on eviction/shutdown.
const STOP_GRACE: Duration = Duration::from_secs(2);

const PLAYLIST: &str = "index.m3u8";
const ENDLIST: &str = "#EXT-X-ENDLIST";

#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    #[error(transparent)]
    Name(#[from] source::SourceError),
    #[error("input \"{0}\" unavailable (cooldown)")]
    Cooldown(String),
    #[error("input \"{0}\" not found")]
    InputNotFound(String),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("input \"{0}\" has no publisher")]
    NoPublisher(String),
    #[error(transparent)]
    Spawn(#[from] crate::ffmpeg::FfmpegError),
    #[error("failed to create session directory: {0}")]
    TempDir(#[source] std::io::Error),
}

/// Result of a serve-file request; the HTTP layer maps this to a response.
#[derive(Debug)]
pub enum ServeOutcome {
    /// Unknown or stale viewer id — the player should stop asking.
    Gone,
    /// No session (or no such file) for this input.
    NotFound,
    /// Session exists but never became ready within the serve-side wait.
    NotReady,
    File {
        body: Vec<u8>,
        content_type: &'static str,
        cacheable: bool,
    },
}

struct SessionState {
    /// viewer id → last heartbeat.
    viewers: HashMap<String, Instant>,
    last_access: Instant,
}

/// One materialized HLS session.
pub struct HlsSession {
    pub input_name: String,
    source_url: String,
    dir: tempfile::TempDir,
    proc: Arc<FfmpegHandle>,
    ready: AtomicBool,
    /// Whether this session holds a refcount on the input relay.
    is_consumer: bool,
    state: std::sync::Mutex<SessionState>,
}

impl HlsSession {
    pub fn dir_path(&self) -> &Path {
        self.dir.path()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn viewer_count(&self) -> usize {
        self.state.lock().unwrap().viewers.len()
    }

    fn touch(&self) {
        self.state.lock().unwrap().last_access = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn backdate_viewer(&self, viewer_id: &str, age: Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(at) = state.viewers.get_mut(viewer_id) {
            *at = Instant::now() - age;
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_access(&self, age: Duration) {
        self.state.lock().unwrap().last_access = Instant::now() - age;
    }
}

pub struct HlsManager {
    sessions: Mutex<HashMap<String, Arc<HlsSession>>>,
    /// input name → when it last failed to materialize.
    cooldown: std::sync::Mutex<HashMap<String, Instant>>,
    /// input name → last "not found" warning, for log rate limiting.
    warn_at: std::sync::Mutex<HashMap<String, Instant>>,
    inputs: Arc<InputRegistry>,
    rtsp: Arc<RtspServer>,
    ffmpeg_path: String,
    tasks: TaskGroup,
    session_timeout: Duration,
    publisher_wait: Duration,
    eviction_cancel: watch::Sender<bool>,
}

impl HlsManager {
    /// Build the manager and start the eviction loop.
    pub fn new(
        inputs: Arc<InputRegistry>,
        rtsp: Arc<RtspServer>,
        ffmpeg_path: String,
        tasks: TaskGroup,
        session_timeout: Duration,
        cleanup_interval: Duration,
        publisher_wait: Duration,
    ) -> Arc<Self> {
        let (eviction_cancel, cancel_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            cooldown: std::sync::Mutex::new(HashMap::new()),
            warn_at: std::sync::Mutex::new(HashMap::new()),
            inputs,
            rtsp,
            ffmpeg_path,
            tasks: tasks.clone(),
            session_timeout,
            publisher_wait,
            eviction_cancel,
        });

        let loop_manager = manager.clone();
        tasks.spawn("hls-eviction", async move {
            eviction_loop(loop_manager, cleanup_interval, cancel_rx).await;
        });
        manager
    }

    /// Get the session for `input_name`, materializing it on first request.
    /// Concurrent calls for the same name share one session.
    pub async fn get_or_start(
        self: &Arc<Self>,
        input_name: &str,
    ) -> Result<Arc<HlsSession>, HlsError> {
        source::validate_name(input_name)?;

        if let Some(failed_at) = self.cooldown.lock().unwrap().get(input_name) {
            if failed_at.elapsed() < FAILURE_COOLDOWN {
                return Err(HlsError::Cooldown(input_name.to_string()));
            }
        }

        // Hold the sessions lock across the whole bring-up so a concurrent
        // request for the same name waits and then finds the session.
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(input_name) {
            session.touch();
            return Ok(session.clone());
        }

        let session = match self.materialize(input_name).await {
            Ok(session) => session,
            Err(e) => {
                // Unknown inputs are a cheap 404, not a failed bring-up.
                if !matches!(e, HlsError::InputNotFound(_)) {
                    self.cooldown
                        .lock()
                        .unwrap()
                        .insert(input_name.to_string(), Instant::now());
                }
                return Err(e);
            }
        };
        sessions.insert(input_name.to_string(), session.clone());
        Ok(session)
    }

    /// Attach to the input, spawn the HLS encoder, arm the readiness waiter.
    async fn materialize(
        self: &Arc<Self>,
        input_name: &str,
    ) -> Result<Arc<HlsSession>, HlsError> {
        let relay = self
            .inputs
            .find_by_name(input_name)
            .await
            .ok_or_else(|| HlsError::InputNotFound(input_name.to_string()))?;
        let source_url = relay.source_url.clone();

        let local_url = self.inputs.attach(&relay.input_name, &source_url).await?;

        if !self
            .rtsp
            .wait_ready(&relay.rtsp_path(), self.publisher_wait)
            .await
        {
            self.inputs.detach(&source_url).await;
            return Err(HlsError::NoPublisher(input_name.to_string()));
        }

        let dir = tempfile::Builder::new()
            .prefix("switchboard-hls-")
            .tempdir()
            .map_err(|e| {
                // The attach must not leak when we cannot even make a dir.
                let inputs = self.inputs.clone();
                let source = source_url.clone();
                let tasks = self.tasks.clone();
                tasks.spawn("hls-tempdir-rollback", async move {
                    inputs.detach(&source).await;
                });
                HlsError::TempDir(e)
            })?;

        let args = hls_args(&local_url, dir.path());
        let proc = Arc::new(FfmpegHandle::new(self.ffmpeg_path.clone(), args));
        if let Err(e) = proc.start() {
            self.inputs.detach(&source_url).await;
            return Err(e.into());
        }

        let session = Arc::new(HlsSession {
            input_name: input_name.to_string(),
            source_url,
            dir,
            proc: proc.clone(),
            ready: AtomicBool::new(false),
            is_consumer: true,
            state: std::sync::Mutex::new(SessionState {
                viewers: HashMap::new(),
                last_access: Instant::now(),
            }),
        });

        let waiter_manager = self.clone();
        let waiter_session = session.clone();
        self.tasks.spawn("hls-readiness", async move {
            readiness_waiter(waiter_manager, waiter_session).await;
        });

        tracing::info!(input = %input_name, "hls session materialized");
        Ok(session)
    }

    // ── Viewer lifecycle ────────────────────────────────────────────

    /// Register a viewer, materializing the session if needed. Returns the
    /// minted viewer id.
    pub async fn add_viewer(self: &Arc<Self>, input_name: &str) -> Result<String, HlsError> {
        let session = self.get_or_start(input_name).await?;
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let viewer_id = format!("viewer_{nanos}_{input_name}");
        {
            let mut state = session.state.lock().unwrap();
            state.viewers.insert(viewer_id.clone(), Instant::now());
            state.last_access = Instant::now();
        }
        tracing::debug!(input = %input_name, viewer = %viewer_id, "viewer joined");
        Ok(viewer_id)
    }

    /// Refresh a viewer's liveness. Returns `false` for unknown sessions or
    /// viewers.
    pub async fn heartbeat(&self, input_name: &str, viewer_id: &str) -> bool {
        let Some(session) = self.sessions.lock().await.get(input_name).cloned() else {
            return false;
        };
        let mut state = session.state.lock().unwrap();
        match state.viewers.get_mut(viewer_id) {
            Some(at) => {
                *at = Instant::now();
                state.last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Drop a viewer. When the last one leaves, the session is scheduled
    /// for near-term eviction (30 s from now) unless someone else joins.
    pub async fn remove_viewer(&self, input_name: &str, viewer_id: &str) {
        let Some(session) = self.sessions.lock().await.get(input_name).cloned() else {
            return;
        };
        let mut state = session.state.lock().unwrap();
        state.viewers.remove(viewer_id);
        if state.viewers.is_empty() {
            state.last_access = Instant::now()
                - self.session_timeout.saturating_sub(Duration::from_secs(30));
            tracing::debug!(input = %input_name, "last viewer left, eviction scheduled");
        }
    }

    // ── Serving ─────────────────────────────────────────────────────

    /// Resolve one HLS file request per the serve policy. `viewer_id` is
    /// the optional `viewerID` query value.
    pub async fn serve(
        &self,
        input_name: &str,
        file: &str,
        viewer_id: Option<&str>,
    ) -> ServeOutcome {
        let session = self.sessions.lock().await.get(input_name).cloned();

        // A request bound to a viewer is refused once that viewer is stale;
        // the player sees 410 and stops polling.
        if let Some(viewer_id) = viewer_id {
            let live = session.as_ref().is_some_and(|s| {
                s.state
                    .lock()
                    .unwrap()
                    .viewers
                    .get(viewer_id)
                    .is_some_and(|at| at.elapsed() <= VIEWER_TIMEOUT)
            });
            if !live {
                return ServeOutcome::Gone;
            }
        }

        let Some(session) = session else {
            self.warn_not_found(input_name);
            return ServeOutcome::NotFound;
        };
        session.touch();

        if !session.is_ready() {
            let deadline = tokio::time::Instant::now() + SERVE_READY_WAIT;
            while !session.is_ready() {
                if tokio::time::Instant::now() >= deadline {
                    return ServeOutcome::NotReady;
                }
                tokio::time::sleep(SERVE_READY_POLL).await;
            }
        }

        if file.contains('/') || file.contains('\\') || file.contains("..") {
            return ServeOutcome::NotFound;
        }
        let (content_type, cacheable) = if file.ends_with(".m3u8") {
            ("application/vnd.apple.mpegurl", false)
        } else if file.ends_with(".ts") {
            ("video/MP2T", true)
        } else {
            return ServeOutcome::NotFound;
        };

        // Small segments are written then renamed; retry briefly rather
        // than bouncing the player.
        let path = session.dir_path().join(file);
        for attempt in 0..OPEN_RETRIES {
            match std::fs::read(&path) {
                Ok(body) => {
                    return ServeOutcome::File {
                        body,
                        content_type,
                        cacheable,
                    }
                }
                Err(_) if attempt + 1 < OPEN_RETRIES => {
                    tokio::time::sleep(OPEN_RETRY_DELAY).await;
                }
                Err(_) => break,
            }
        }
        ServeOutcome::NotFound
    }

    /// Per-input-name rate limit on the "not found" warning.
    fn warn_not_found(&self, input_name: &str) {
        let mut warn_at = self.warn_at.lock().unwrap();
        let now = Instant::now();
        let warn = match warn_at.get(input_name) {
            Some(last) => now.duration_since(*last) >= WARN_WINDOW,
            None => true,
        };
        if warn {
            warn_at.insert(input_name.to_string(), now);
            tracing::warn!(input = %input_name, "hls request for unknown input");
        }
    }

    // ── Eviction ────────────────────────────────────────────────────

    /// One eviction pass: reap stale viewers, then evict idle sessions.
    /// Sessions with live viewers get three timeouts of slack (a playing
    /// client keeps touching `last_access` anyway).
    pub async fn evict_idle(&self) {
        let sessions: Vec<_> = {
            let map = self.sessions.lock().await;
            map.values().cloned().collect()
        };

        let mut to_evict = Vec::new();
        for session in sessions {
            let (has_viewers, idle) = {
                let mut state = session.state.lock().unwrap();
                state
                    .viewers
                    .retain(|id, at| {
                        let live = at.elapsed() <= VIEWER_TIMEOUT;
                        if !live {
                            tracing::debug!(viewer = %id, "viewer reaped");
                        }
                        live
                    });
                (!state.viewers.is_empty(), state.last_access.elapsed())
            };

            let limit = if has_viewers {
                self.session_timeout * 3
            } else {
                self.session_timeout
            };
            if idle > limit {
                to_evict.push(session);
            }
        }

        for session in to_evict {
            self.evict(&session).await;
        }
    }

    async fn evict(&self, session: &Arc<HlsSession>) {
        self.sessions.lock().await.remove(&session.input_name);
        if session.is_consumer {
            self.inputs.detach(&session.source_url).await;
        }
        session.proc.stop(STOP_GRACE).await;
        // The temp directory is removed when the last Arc drops.
        tracing::info!(input = %session.input_name, "hls session evicted");
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Append `#EXT-X-ENDLIST` to every live playlist (dropping any prior
    /// endlist first) so connected players see a clean end of stream.
    pub async fn write_endlist_to_all(&self) {
        let sessions: Vec<_> = {
            let map = self.sessions.lock().await;
            map.values().cloned().collect()
        };
        for session in sessions {
            let playlist = session.dir_path().join(PLAYLIST);
            let Ok(content) = std::fs::read_to_string(&playlist) else {
                continue;
            };
            let mut lines: Vec<&str> = content
                .lines()
                .filter(|line| line.trim() != ENDLIST)
                .collect();
            lines.push(ENDLIST);
            let body = format!("{}\n", lines.join("\n"));
            if let Err(e) = std::fs::write(&playlist, body) {
                tracing::warn!(
                    input = %session.input_name,
                    error = %e,
                    "failed to endlist playlist"
                );
            }
        }
        tracing::info!("endlist appended to live playlists");
    }

    /// Tear every session down and stop the eviction loop.
    pub async fn shutdown(&self) {
        let _ = self.eviction_cancel.send(true);
        let sessions: Vec<_> = {
            let mut map = self.sessions.lock().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            if session.is_consumer {
                self.inputs.detach(&session.source_url).await;
            }
            session.proc.stop(STOP_GRACE).await;
        }
        tracing::info!("hls manager shut down");
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn get_session(&self, input_name: &str) -> Option<Arc<HlsSession>> {
        self.sessions.lock().await.get(input_name).cloned()
    }
}

async fn eviction_loop(
    manager: Arc<HlsManager>,
    interval: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => manager.evict_idle().await,
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Wait for the playlist to exist and be non-empty: filesystem
/// notifications under a hard cap, with pure polling as the fallback when
/// the watcher cannot be armed.
async fn readiness_waiter(manager: Arc<HlsManager>, session: Arc<HlsSession>) {
    let playlist = session.dir_path().join(PLAYLIST);

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.try_send(());
        }
    })
    .and_then(|mut w| {
        w.watch(session.dir_path(), notify::RecursiveMode::NonRecursive)?;
        Ok(w)
    });

    let became_ready = match watcher {
        Ok(_watcher) => {
            let deadline = tokio::time::Instant::now() + READY_CAP;
            loop {
                if playlist_nonempty(&playlist) {
                    break true;
                }
                let remaining = deadline
                    .checked_duration_since(tokio::time::Instant::now())
                    .unwrap_or(Duration::ZERO);
                if remaining.is_zero() {
                    break false;
                }
                // Wake on a directory event or re-check periodically.
                let _ = tokio::time::timeout(remaining.min(READY_POLL), rx.recv()).await;
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "playlist watcher unavailable, polling");
            let mut ready = false;
            for _ in 0..READY_POLL_ROUNDS {
                if playlist_nonempty(&playlist) {
                    ready = true;
                    break;
                }
                tokio::time::sleep(READY_POLL).await;
            }
            ready
        }
    };

    if became_ready {
        session.ready.store(true, Ordering::SeqCst);
        tracing::info!(input = %session.input_name, "hls playlist ready");
    } else {
        manager
            .cooldown
            .lock()
            .unwrap()
            .insert(session.input_name.clone(), Instant::now());
        tracing::error!(
            input = %session.input_name,
            tail = %session.proc.output_tail(10),
            "hls playlist never became ready"
        );
    }
}

fn playlist_nonempty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// HLS argument vector: RTSP/TCP input with limited probing, H.264
/// ultrafast/zerolatency + stereo AAC, 2 s segments, rolling playlist of 6.
fn hls_args(local_url: &str, dir: &Path) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-rtsp_transport",
        "tcp",
        "-analyzeduration",
        "1000000",
        "-probesize",
        "1000000",
        "-i",
        local_url,
        "-c:v",
        "libx264",
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-c:a",
        "aac",
        "-ac",
        "2",
        "-ar",
        "44100",
        "-f",
        "hls",
        "-hls_time",
        "2",
        "-hls_list_size",
        "6",
        "-hls_flags",
        "delete_segments+append_list",
        "-hls_segment_filename",
    ]
    .into_iter()
    .map(String::from)
    .chain([
        dir.join("segment_%03d.ts").display().to_string(),
        dir.join(PLAYLIST).display().to_string(),
    ])
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_publisher, stub_encoder_script};

    /// Stub that writes a playlist to the session dir (the last argument)
    /// and keeps running, like the real HLS encoder.
    fn hls_stub(dir: &Path) -> String {
        stub_encoder_script(
            dir,
            "eval \"out=\\${$#}\"\n\
             printf '#EXTM3U\\n#EXT-X-VERSION:3\\n#EXTINF:2.0,\\nsegment_000.ts\\n' > \"$out\"\n\
             exec sleep 30\n",
        )
    }

    struct Fixture {
        manager: Arc<HlsManager>,
        inputs: Arc<InputRegistry>,
        rtsp: Arc<RtspServer>,
        _dir: tempfile::TempDir,
    }

    /// Bring up a registry with one relay known as `cam` plus a fake
    /// publisher, so HLS sessions have an input to consume.
    async fn fixture() -> (Fixture, tokio::net::TcpStream) {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = hls_stub(dir.path());
        let tasks = TaskGroup::new();
        let rtsp = RtspServer::bind("127.0.0.1:0", &tasks).await.unwrap();
        let inputs = Arc::new(InputRegistry::new(
            rtsp.clone(),
            rtsp.local_addr().to_string(),
            dir.path().to_path_buf(),
            ffmpeg.clone(),
            tasks.clone(),
        ));

        // Register the relay (as a relay consumer would) and publish.
        inputs.attach("cam", "rtsp://a/x").await.unwrap();
        let publisher = fake_publisher(rtsp.local_addr(), "relay/cam").await;

        let manager = HlsManager::new(
            inputs.clone(),
            rtsp.clone(),
            ffmpeg,
            tasks,
            Duration::from_secs(300),
            Duration::from_secs(120),
            Duration::from_secs(2),
        );
        (
            Fixture {
                manager,
                inputs,
                rtsp,
                _dir: dir,
            },
            publisher,
        )
    }

    async fn wait_ready(session: &Arc<HlsSession>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !session.is_ready() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "session never became ready"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let (f, _pub) = fixture().await;
        for bad in ["a/b", "a\\b", "..", ""] {
            assert!(
                matches!(f.manager.get_or_start(bad).await, Err(HlsError::Name(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn unknown_input_is_an_error() {
        let (f, _pub) = fixture().await;
        assert!(matches!(
            f.manager.get_or_start("ghost").await,
            Err(HlsError::InputNotFound(_))
        ));
    }

    #[tokio::test]
    async fn session_is_idempotent_and_holds_one_refcount() {
        let (f, _pub) = fixture().await;

        let relay = f.inputs.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.refcount().await, 1); // the fixture's own attach

        let a = f.manager.get_or_start("cam").await.unwrap();
        assert_eq!(relay.refcount().await, 2);

        let b = f.manager.get_or_start("cam").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(relay.refcount().await, 2);
        assert_eq!(f.manager.session_count().await, 1);

        wait_ready(&a).await;
        assert!(a.dir_path().join(PLAYLIST).exists());

        f.manager.shutdown().await;
        assert_eq!(relay.refcount().await, 1);
    }

    #[tokio::test]
    async fn failed_materialization_sets_a_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = hls_stub(dir.path());
        let tasks = TaskGroup::new();
        let rtsp = RtspServer::bind("127.0.0.1:0", &tasks).await.unwrap();
        let inputs = Arc::new(InputRegistry::new(
            rtsp.clone(),
            rtsp.local_addr().to_string(),
            dir.path().to_path_buf(),
            ffmpeg.clone(),
            tasks.clone(),
        ));
        // Relay exists but nobody publishes.
        inputs.attach("cam", "rtsp://a/x").await.unwrap();

        let manager = HlsManager::new(
            inputs.clone(),
            rtsp,
            ffmpeg,
            tasks,
            Duration::from_secs(300),
            Duration::from_secs(120),
            Duration::from_millis(200),
        );

        assert!(matches!(
            manager.get_or_start("cam").await,
            Err(HlsError::NoPublisher(_))
        ));
        // The failed attach was rolled back.
        assert_eq!(inputs.get("rtsp://a/x").await.unwrap().refcount().await, 1);

        // Second request fails fast on the cooldown.
        let err = match manager.get_or_start("cam").await {
            Err(e) => e,
            Ok(_) => panic!("expected cooldown error"),
        };
        assert!(matches!(err, HlsError::Cooldown(_)));
        assert!(err.to_string().contains("unavailable (cooldown)"));
    }

    #[tokio::test]
    async fn viewer_lifecycle() {
        let (f, _pub) = fixture().await;

        let viewer = f.manager.add_viewer("cam").await.unwrap();
        assert!(viewer.starts_with("viewer_"));
        assert!(viewer.ends_with("_cam"));

        assert!(f.manager.heartbeat("cam", &viewer).await);
        assert!(!f.manager.heartbeat("cam", "viewer_0_cam").await);
        assert!(!f.manager.heartbeat("ghost", &viewer).await);

        let session = f.manager.get_session("cam").await.unwrap();
        assert_eq!(session.viewer_count(), 1);

        f.manager.remove_viewer("cam", &viewer).await;
        assert_eq!(session.viewer_count(), 0);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn stale_viewers_are_reaped_and_idle_sessions_evicted() {
        let (f, _pub) = fixture().await;

        let viewer = f.manager.add_viewer("cam").await.unwrap();
        let session = f.manager.get_session("cam").await.unwrap();

        // Viewer goes silent past the timeout.
        session.backdate_viewer(&viewer, Duration::from_secs(35));
        f.manager.evict_idle().await;
        assert_eq!(session.viewer_count(), 0);
        // Session itself not yet idle long enough.
        assert_eq!(f.manager.session_count().await, 1);

        // Now the session has been idle past the timeout.
        session.backdate_access(Duration::from_secs(301));
        f.manager.evict_idle().await;
        assert_eq!(f.manager.session_count().await, 0);

        // Eviction released the session's input reference.
        let relay = f.inputs.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.refcount().await, 1);
    }

    #[tokio::test]
    async fn session_with_live_viewer_gets_extra_slack() {
        let (f, _pub) = fixture().await;
        let _viewer = f.manager.add_viewer("cam").await.unwrap();
        let session = f.manager.get_session("cam").await.unwrap();

        // Idle past one timeout but under three: survives.
        session.backdate_access(Duration::from_secs(301));
        f.manager.evict_idle().await;
        assert_eq!(f.manager.session_count().await, 1);

        // Idle past three timeouts: evicted even with a live viewer.
        session.backdate_access(Duration::from_secs(901));
        f.manager.evict_idle().await;
        assert_eq!(f.manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn serve_policy() {
        let (f, _pub) = fixture().await;

        // No session yet.
        assert!(matches!(
            f.manager.serve("cam", PLAYLIST, None).await,
            ServeOutcome::NotFound
        ));

        let viewer = f.manager.add_viewer("cam").await.unwrap();
        let session = f.manager.get_session("cam").await.unwrap();
        wait_ready(&session).await;

        // Playlist serves with the HLS content type.
        match f.manager.serve("cam", PLAYLIST, Some(&viewer)).await {
            ServeOutcome::File {
                body,
                content_type,
                cacheable,
            } => {
                assert!(String::from_utf8_lossy(&body).contains("#EXTM3U"));
                assert_eq!(content_type, "application/vnd.apple.mpegurl");
                assert!(!cacheable);
            }
            other => panic!("expected file, got {other:?}"),
        }

        // Stale viewer → gone.
        session.backdate_viewer(&viewer, Duration::from_secs(35));
        assert!(matches!(
            f.manager.serve("cam", PLAYLIST, Some(&viewer)).await,
            ServeOutcome::Gone
        ));

        // Traversal and non-HLS files are refused.
        assert!(matches!(
            f.manager.serve("cam", "../etc/passwd", None).await,
            ServeOutcome::NotFound
        ));
        assert!(matches!(
            f.manager.serve("cam", "index.html", None).await,
            ServeOutcome::NotFound
        ));
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn endlist_is_written_exactly_once() {
        let (f, _pub) = fixture().await;
        let session = f.manager.get_or_start("cam").await.unwrap();
        wait_ready(&session).await;

        f.manager.write_endlist_to_all().await;
        f.manager.write_endlist_to_all().await;

        let playlist =
            std::fs::read_to_string(session.dir_path().join(PLAYLIST)).unwrap();
        let endlists = playlist
            .lines()
            .filter(|l| l.trim() == ENDLIST)
            .count();
        assert_eq!(endlists, 1);
        assert!(playlist.trim_end().ends_with(ENDLIST));
        f.manager.shutdown().await;
    }

    #[test]
    fn hls_args_transcode_ladder() {
        let args = hls_args("rtsp://l/relay/x", Path::new("/tmp/session"));
        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp"));
        assert!(joined.contains("-c:v libx264 -preset ultrafast -tune zerolatency"));
        assert!(joined.contains("-c:a aac -ac 2 -ar 44100"));
        assert!(joined.contains("-hls_time 2 -hls_list_size 6"));
        assert!(joined.contains("-hls_flags delete_segments+append_list"));
        assert!(joined.contains("-hls_segment_filename /tmp/session/segment_%03d.ts"));
        assert!(joined.ends_with("/tmp/session/index.m3u8"));
    }

    #[tokio::test]
    async fn shutdown_clears_sessions_and_directories() {
        let (f, _pub) = fixture().await;
        let session = f.manager.get_or_start("cam").await.unwrap();
        let dir = session.dir_path().to_path_buf();
        assert!(dir.exists());

        f.manager.shutdown().await;
        assert_eq!(f.manager.session_count().await, 0);

        drop(session);
        assert!(!dir.exists());
    }
}
