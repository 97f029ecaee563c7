//! Input relay registry — one refcounted ingest encoder per source URL.
//!
//! The registry guarantees at-most-one ingest encoder per distinct source
//! while any number of consumers (outputs, recordings, HLS sessions) attach
//! and detach concurrently. Every successful `attach` must be paired with
//! exactly one `detach`; the encoder is torn down only when the count
//! reaches zero. Records persist in the registry at refcount zero (state
//! history for the UI) until `delete`.
//!
//! Locking: registry map mutex → record mutex, strictly in that order, and
//! never across a process wait or network call — handles are cloned out
//! under lock and operated on after release.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::ffmpeg::{FfmpegError, FfmpegHandle, Sample};
use crate::rtsp::RtspServer;
use crate::source::{self, SourceError};
use crate::tasks::TaskGroup;

/// Grace given to an ingest encoder on teardown before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// Bounded wait for a relay's owned tasks on detach.
const TASK_JOIN_WAIT: Duration = Duration::from_secs(5);
/// Second-chance wait after the hard kill.
const TASK_JOIN_RETRY: Duration = Duration::from_secs(2);
/// Progress sampling interval.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Spawn(#[from] FfmpegError),
}

/// Externally visible relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Starting,
    Running,
    Stopped,
    Error,
}

/// Snapshot of one input relay for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct InputStatus {
    pub source_url: String,
    pub input_name: String,
    pub local_url: String,
    pub state: RelayState,
    pub refcount: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

struct RelayInner {
    state: RelayState,
    refcount: u32,
    proc: Option<Arc<FfmpegHandle>>,
    last_error: Option<String>,
    last_speed: Option<Sample>,
    last_bitrate: Option<Sample>,
    /// Bumped once per spawned encoder so a stale monitor cannot reclassify
    /// a newer process's state.
    generation: u64,
    cancel_tx: Option<watch::Sender<bool>>,
    owned_tasks: Vec<JoinHandle<()>>,
}

/// One refcounted ingest relay, keyed by its source URL.
pub struct InputRelay {
    pub source_url: String,
    pub input_name: String,
    pub local_url: String,
    inner: Mutex<RelayInner>,
}

impl InputRelay {
    fn new(source_url: String, input_name: String, local_url: String) -> Self {
        Self {
            source_url,
            input_name,
            local_url,
            inner: Mutex::new(RelayInner {
                state: RelayState::Stopped,
                refcount: 0,
                proc: None,
                last_error: None,
                last_speed: None,
                last_bitrate: None,
                generation: 0,
                cancel_tx: None,
                owned_tasks: Vec::new(),
            }),
        }
    }

    pub fn rtsp_path(&self) -> String {
        format!("relay/{}", self.input_name)
    }

    pub async fn status(&self) -> InputStatus {
        let inner = self.inner.lock().await;
        let (speed, bitrate, updated_at) = {
            let s = inner.last_speed;
            let b = inner.last_bitrate;
            let at = match (s, b) {
                (Some(s), Some(b)) => Some(s.at.max(b.at)),
                (Some(s), None) => Some(s.at),
                (None, Some(b)) => Some(b.at),
                (None, None) => None,
            };
            (s.map(|v| v.value), b.map(|v| v.value), at)
        };
        InputStatus {
            source_url: self.source_url.clone(),
            input_name: self.input_name.clone(),
            local_url: self.local_url.clone(),
            state: inner.state,
            refcount: inner.refcount,
            pid: inner.proc.as_ref().and_then(|p| p.pid()),
            started_at: inner.proc.as_ref().and_then(|p| p.started_at()),
            last_error: inner.last_error.clone(),
            speed,
            bitrate_kbps: bitrate,
            updated_at,
        }
    }

    pub async fn refcount(&self) -> u32 {
        self.inner.lock().await.refcount
    }

    pub async fn state(&self) -> RelayState {
        self.inner.lock().await.state
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.proc.as_ref().and_then(|p| p.pid())
    }
}

/// The registry of input relays.
pub struct InputRegistry {
    relays: Mutex<HashMap<String, Arc<InputRelay>>>,
    rtsp: Arc<RtspServer>,
    /// host:port readers use to reach the RTSP server (goes into local_url).
    advertise: String,
    recordings_dir: PathBuf,
    ffmpeg_path: String,
    tasks: TaskGroup,
}

impl InputRegistry {
    pub fn new(
        rtsp: Arc<RtspServer>,
        advertise: String,
        recordings_dir: PathBuf,
        ffmpeg_path: String,
        tasks: TaskGroup,
    ) -> Self {
        Self {
            relays: Mutex::new(HashMap::new()),
            rtsp,
            advertise,
            recordings_dir,
            ffmpeg_path,
            tasks,
        }
    }

    /// Register a consumer for `source_url`, starting the ingest encoder if
    /// this is the first one. Returns the relay's local RTSP URL. The caller
    /// owes exactly one `detach` for every successful return.
    pub async fn attach(
        &self,
        input_name: &str,
        source_url: &str,
    ) -> Result<String, InputError> {
        source::validate_name(input_name)?;
        let resolved = source::resolve(source_url, &self.recordings_dir)?;

        // Find-or-create under the registry lock, then drop it before
        // taking the record lock's slow path.
        let relay = {
            let mut relays = self.relays.lock().await;
            relays
                .entry(source_url.to_string())
                .or_insert_with(|| {
                    let local_url =
                        format!("rtsp://{}/relay/{}", self.advertise, input_name);
                    Arc::new(InputRelay::new(
                        source_url.to_string(),
                        input_name.to_string(),
                        local_url,
                    ))
                })
                .clone()
        };

        let mut inner = relay.inner.lock().await;
        inner.refcount += 1;
        let refcount = inner.refcount;

        if matches!(inner.state, RelayState::Starting | RelayState::Running) {
            tracing::debug!(
                source = %source_url,
                refcount,
                "attach reuses running ingest"
            );
            return Ok(relay.local_url.clone());
        }

        // First consumer (or relay previously stopped/errored): bring the
        // encoder up while still holding the record lock so no one observes
        // a half-built relay.
        inner.state = RelayState::Starting;
        inner.generation += 1;
        let generation = inner.generation;

        let args = ingest_args(&resolved.input_arg(), &relay.local_url);
        let handle = Arc::new(FfmpegHandle::new(self.ffmpeg_path.clone(), args));
        if let Err(e) = handle.start() {
            inner.refcount -= 1;
            inner.state = RelayState::Error;
            inner.last_error = Some(e.to_string());
            tracing::error!(source = %source_url, error = %e, "ingest spawn failed");
            return Err(e.into());
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let monitor = self.tasks.spawn(
            "input-monitor",
            monitor_task(relay.clone(), handle.clone(), generation),
        );
        let sampler = self.tasks.spawn(
            "input-progress",
            progress_task(relay.clone(), handle.clone(), cancel_rx),
        );

        inner.proc = Some(handle);
        inner.cancel_tx = Some(cancel_tx);
        inner.owned_tasks = vec![monitor, sampler];
        inner.state = RelayState::Running;

        tracing::info!(
            source = %source_url,
            input = %input_name,
            local_url = %relay.local_url,
            "ingest encoder started"
        );
        Ok(relay.local_url.clone())
    }

    /// Drop one consumer reference. Returns `true` when this call tore the
    /// ingest down (count reached zero). Unknown sources and decrements
    /// below zero are logged no-ops.
    pub async fn detach(&self, source_url: &str) -> bool {
        self.detach_inner(source_url, false).await
    }

    /// Like `detach`, but zeroes the refcount regardless of its value.
    /// Used during shutdown and refcount reconciliation.
    pub async fn force_detach(&self, source_url: &str) -> bool {
        self.detach_inner(source_url, true).await
    }

    async fn detach_inner(&self, source_url: &str, force: bool) -> bool {
        let Some(relay) = self.relays.lock().await.get(source_url).cloned() else {
            tracing::warn!(source = %source_url, "detach on unknown input, ignoring");
            return false;
        };

        let teardown = {
            let mut inner = relay.inner.lock().await;
            if force {
                inner.refcount = 0;
            } else {
                if inner.refcount == 0 {
                    tracing::warn!(
                        source = %source_url,
                        "detach below zero, ignoring"
                    );
                    return false;
                }
                inner.refcount -= 1;
                if inner.refcount > 0 {
                    tracing::debug!(
                        source = %source_url,
                        refcount = inner.refcount,
                        "detach leaves ingest running"
                    );
                    return false;
                }
            }
            inner.state = RelayState::Stopped;
            Some((
                inner.proc.take(),
                inner.cancel_tx.take(),
                std::mem::take(&mut inner.owned_tasks),
            ))
        };

        if let Some((proc, cancel_tx, owned_tasks)) = teardown {
            self.teardown(&relay, proc, cancel_tx, owned_tasks).await;
        }
        true
    }

    /// Stop the encoder and reap the relay's tasks, with bounded escalation.
    async fn teardown(
        &self,
        relay: &Arc<InputRelay>,
        proc: Option<Arc<FfmpegHandle>>,
        cancel_tx: Option<watch::Sender<bool>>,
        owned_tasks: Vec<JoinHandle<()>>,
    ) {
        if let Some(proc) = proc.as_ref() {
            proc.stop(STOP_GRACE).await;
        }
        if let Some(cancel_tx) = cancel_tx {
            let _ = cancel_tx.send(true);
        }

        let mut owned_tasks = owned_tasks;
        if tokio::time::timeout(TASK_JOIN_WAIT, join_tasks(&mut owned_tasks))
            .await
            .is_err()
        {
            tracing::warn!(
                source = %relay.source_url,
                "relay tasks did not finish in time, hard-killing encoder"
            );
            if let Some(proc) = proc.as_ref() {
                proc.kill();
            }
            if tokio::time::timeout(TASK_JOIN_RETRY, join_tasks(&mut owned_tasks))
                .await
                .is_err()
            {
                tracing::warn!(
                    source = %relay.source_url,
                    outstanding = owned_tasks.len(),
                    "proceeding with teardown despite stuck relay tasks"
                );
            }
        }

        self.rtsp.remove_stream(&relay.rtsp_path());
        tracing::info!(source = %relay.source_url, "ingest torn down");
    }

    /// Force-terminate and remove the record entirely.
    pub async fn delete(&self, source_url: &str) -> bool {
        let removed = self.relays.lock().await.remove(source_url);
        let Some(relay) = removed else {
            return false;
        };
        let (proc, cancel_tx, owned_tasks) = {
            let mut inner = relay.inner.lock().await;
            inner.refcount = 0;
            inner.state = RelayState::Stopped;
            (
                inner.proc.take(),
                inner.cancel_tx.take(),
                std::mem::take(&mut inner.owned_tasks),
            )
        };
        self.teardown(&relay, proc, cancel_tx, owned_tasks).await;
        tracing::info!(source = %source_url, "input relay deleted");
        true
    }

    pub async fn get(&self, source_url: &str) -> Option<Arc<InputRelay>> {
        self.relays.lock().await.get(source_url).cloned()
    }

    /// Look a relay up by its stable input name (HLS sessions are addressed
    /// by name, not source URL).
    pub async fn find_by_name(&self, input_name: &str) -> Option<Arc<InputRelay>> {
        self.relays
            .lock()
            .await
            .values()
            .find(|r| r.input_name == input_name)
            .cloned()
    }

    /// Source URLs of every known relay (including stopped history records).
    pub async fn source_urls(&self) -> Vec<String> {
        let mut urls: Vec<_> = self.relays.lock().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub async fn statuses(&self) -> Vec<InputStatus> {
        let relays: Vec<_> = {
            let map = self.relays.lock().await;
            map.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(relays.len());
        for relay in relays {
            out.push(relay.status().await);
        }
        out.sort_by(|a, b| a.source_url.cmp(&b.source_url));
        out
    }
}

/// Join `tasks`, popping each as it completes so a timed-out caller can
/// resume with the survivors.
async fn join_tasks(tasks: &mut Vec<JoinHandle<()>>) {
    while let Some(task) = tasks.last_mut() {
        let _ = task.await;
        tasks.pop();
    }
}

/// Ingest argument vector: re-timestamped input, stream copy, RTSP/TCP
/// publish to the local server, progress sink on stdout.
fn ingest_args(input: &str, local_url: &str) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-progress",
        "pipe:1",
        "-re",
        "-fflags",
        "+genpts",
        "-i",
        input,
        "-c",
        "copy",
        "-f",
        "rtsp",
        "-rtsp_transport",
        "tcp",
        local_url,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Waits for the encoder to exit and classifies the exit: intentional when
/// the refcount already reached zero, unexpected otherwise. Never restarts —
/// restart policy belongs to the coordinator.
async fn monitor_task(relay: Arc<InputRelay>, handle: Arc<FfmpegHandle>, generation: u64) {
    let status = handle.wait_done().await;

    let mut inner = relay.inner.lock().await;
    if inner.generation != generation {
        // A newer encoder already replaced this one.
        return;
    }
    if inner.refcount == 0 {
        inner.state = RelayState::Stopped;
        tracing::info!(source = %relay.source_url, "ingest exited after stop");
    } else {
        let tail = handle.output_tail(10);
        inner.state = RelayState::Error;
        inner.last_error = Some(format!("encoder exited unexpectedly ({status}): {tail}"));
        tracing::error!(
            source = %relay.source_url,
            %status,
            tail = %tail,
            "ingest encoder exited unexpectedly"
        );
    }
}

/// Samples the handle's parsed progress into the record until cancelled or
/// the encoder exits.
async fn progress_task(
    relay: Arc<InputRelay>,
    handle: Arc<FfmpegHandle>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(PROGRESS_INTERVAL) => {}
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    return;
                }
            }
        }
        if handle.is_done() {
            return;
        }
        let speed = handle.speed();
        let bitrate = handle.bitrate_kbps();
        if speed.is_none() && bitrate.is_none() {
            continue;
        }
        let mut inner = relay.inner.lock().await;
        if speed.is_some() {
            inner.last_speed = speed;
        }
        if bitrate.is_some() {
            inner.last_bitrate = bitrate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{stub_encoder, stub_encoder_script};

    async fn registry(dir: &std::path::Path, ffmpeg: &str) -> InputRegistry {
        let tasks = TaskGroup::new();
        let rtsp = RtspServer::bind("127.0.0.1:0", &tasks).await.unwrap();
        InputRegistry::new(
            rtsp,
            "127.0.0.1:8554".into(),
            dir.to_path_buf(),
            ffmpeg.into(),
            tasks,
        )
    }

    #[tokio::test]
    async fn attach_starts_one_encoder_and_counts_references() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder(dir.path());
        let reg = registry(dir.path(), &ffmpeg).await;

        let url = reg.attach("cam", "rtsp://a/x").await.unwrap();
        assert_eq!(url, "rtsp://127.0.0.1:8554/relay/cam");

        let relay = reg.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.refcount().await, 1);
        assert_eq!(relay.state().await, RelayState::Running);
        let first_pid = relay.pid().await.unwrap();

        // Second consumer reuses the same encoder.
        let url2 = reg.attach("cam", "rtsp://a/x").await.unwrap();
        assert_eq!(url, url2);
        assert_eq!(relay.refcount().await, 2);
        assert_eq!(relay.pid().await.unwrap(), first_pid);

        reg.force_detach("rtsp://a/x").await;
    }

    #[tokio::test]
    async fn detach_tears_down_only_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder(dir.path());
        let reg = registry(dir.path(), &ffmpeg).await;

        reg.attach("cam", "rtsp://a/x").await.unwrap();
        reg.attach("cam", "rtsp://a/x").await.unwrap();
        let relay = reg.get("rtsp://a/x").await.unwrap();

        assert!(!reg.detach("rtsp://a/x").await);
        assert_eq!(relay.refcount().await, 1);
        assert_eq!(relay.state().await, RelayState::Running);

        assert!(reg.detach("rtsp://a/x").await);
        assert_eq!(relay.refcount().await, 0);
        assert_eq!(relay.state().await, RelayState::Stopped);
        assert_eq!(relay.pid().await, None);

        // History record survives at refcount zero.
        assert!(reg.get("rtsp://a/x").await.is_some());
    }

    #[tokio::test]
    async fn detach_on_unknown_or_underflow_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder(dir.path());
        let reg = registry(dir.path(), &ffmpeg).await;

        assert!(!reg.detach("rtsp://nobody/home").await);

        reg.attach("cam", "rtsp://a/x").await.unwrap();
        assert!(reg.detach("rtsp://a/x").await);
        // Underflow: the relay exists but its count is already zero.
        assert!(!reg.detach("rtsp://a/x").await);
    }

    #[tokio::test]
    async fn spawn_failure_rolls_the_refcount_back() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), "/nonexistent/encoder-binary").await;

        let err = reg.attach("cam", "rtsp://a/x").await;
        assert!(err.is_err());

        let relay = reg.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.refcount().await, 0);
        assert_eq!(relay.state().await, RelayState::Error);
        assert!(relay.status().await.last_error.is_some());
    }

    #[tokio::test]
    async fn unexpected_exit_is_classified_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder_script(dir.path(), "exit 1\n");
        let reg = registry(dir.path(), &ffmpeg).await;

        reg.attach("cam", "rtsp://a/x").await.unwrap();
        let relay = reg.get("rtsp://a/x").await.unwrap();

        // Encoder dies while the refcount is still 1.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while relay.state().await != RelayState::Error {
            assert!(
                tokio::time::Instant::now() < deadline,
                "exit never classified as error"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(relay
            .status()
            .await
            .last_error
            .unwrap()
            .contains("unexpectedly"));
        // The count is untouched by the failure; cleanup is the consumer's.
        assert_eq!(relay.refcount().await, 1);

        reg.detach("rtsp://a/x").await;
    }

    #[tokio::test]
    async fn attach_after_error_restarts_the_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder(dir.path());
        let reg = registry(dir.path(), &ffmpeg).await;

        reg.attach("cam", "rtsp://a/x").await.unwrap();
        assert!(reg.detach("rtsp://a/x").await);

        let relay = reg.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.state().await, RelayState::Stopped);

        reg.attach("cam", "rtsp://a/x").await.unwrap();
        assert_eq!(relay.state().await, RelayState::Running);
        assert_eq!(relay.refcount().await, 1);
        reg.force_detach("rtsp://a/x").await;
    }

    #[tokio::test]
    async fn force_detach_ignores_outstanding_references() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder(dir.path());
        let reg = registry(dir.path(), &ffmpeg).await;

        reg.attach("cam", "rtsp://a/x").await.unwrap();
        reg.attach("cam", "rtsp://a/x").await.unwrap();
        reg.attach("cam", "rtsp://a/x").await.unwrap();

        assert!(reg.force_detach("rtsp://a/x").await);
        let relay = reg.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.refcount().await, 0);
        assert_eq!(relay.state().await, RelayState::Stopped);
        assert_eq!(relay.pid().await, None);
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder(dir.path());
        let reg = registry(dir.path(), &ffmpeg).await;

        reg.attach("cam", "rtsp://a/x").await.unwrap();
        assert!(reg.delete("rtsp://a/x").await);
        assert!(reg.get("rtsp://a/x").await.is_none());
        assert!(!reg.delete("rtsp://a/x").await);
    }

    #[tokio::test]
    async fn file_source_must_exist_under_recordings_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder(dir.path());
        let reg = registry(dir.path(), &ffmpeg).await;

        assert!(matches!(
            reg.attach("clip", "file://missing.mp4").await,
            Err(InputError::Source(SourceError::NotFound(_)))
        ));
        assert!(matches!(
            reg.attach("clip", "file://../escape.mp4").await,
            Err(InputError::Source(SourceError::Traversal(_)))
        ));
    }

    #[test]
    fn ingest_args_copy_and_republish() {
        let args = ingest_args("rtsp://cam.local/stream", "rtsp://127.0.0.1:8554/relay/cam");
        let joined = args.join(" ");
        assert!(joined.contains("-progress pipe:1"));
        assert!(joined.contains("-re -fflags +genpts -i rtsp://cam.local/stream"));
        assert!(joined.contains("-c copy"));
        assert!(joined.ends_with("-f rtsp -rtsp_transport tcp rtsp://127.0.0.1:8554/relay/cam"));
    }

    #[tokio::test]
    async fn invalid_input_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder(dir.path());
        let reg = registry(dir.path(), &ffmpeg).await;

        assert!(reg.attach("a/b", "rtsp://a/x").await.is_err());
        assert!(reg.attach("..", "rtsp://a/x").await.is_err());
    }
}
