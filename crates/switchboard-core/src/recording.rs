//! Recording manager — MP4 captures piggy-backing on the input relays.
//!
//! A recording is a consumer of an input relay like any egress leg: it
//! attaches (one refcount), spawns its own private encoder writing
//! `<recordings_dir>/<name>_<unix>.mp4`, and detaches exactly once when the
//! encoder exits. Stop requests deliver SIGINT so the encoder finalizes the
//! MP4 index before exiting. A directory watcher publishes "update" edges
//! to the event broker so the UI re-reads the list on any on-disk change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use notify::Watcher;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::events::EventBroker;
use crate::ffmpeg::{FfmpegError, FfmpegHandle};
use crate::input::{InputError, InputRegistry};
use crate::rtsp::RtspServer;
use crate::source::{self, SourceError};
use crate::tasks::TaskGroup;

/// How long a stop waits for the encoder to flush the MP4 after SIGINT
/// before escalating.
const FLUSH_WAIT: Duration = Duration::from_secs(10);
/// Escalation grace after the flush window.
const FLUSH_ESCALATION_GRACE: Duration = Duration::from_secs(2);
/// Bound on waiting for active recordings to drain in `stop_all`.
const STOP_ALL_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("recording \"{name}\" for {source_url} already exists")]
    AlreadyExists { name: String, source_url: String },
    #[error("recording not found")]
    NotFound,
    #[error("cannot delete active recording")]
    ActiveRecording,
    #[error(transparent)]
    Name(#[from] SourceError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("input for recording \"{0}\" did not become ready")]
    InputNotReady(String),
    #[error(transparent)]
    Spawn(#[from] FfmpegError),
    #[error("filesystem error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The stop signal was delivered to a live recording.
    Stopping,
    /// The recording had already finished; treated as success.
    AlreadyFinished,
}

/// One recording, as reported by `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct Recording {
    pub key: String,
    pub name: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub file_size: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub active: bool,
}

struct RecordingRecord {
    name: String,
    source: String,
    file_path: Option<PathBuf>,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    /// Size captured at completion; live recordings are measured from disk.
    file_size: u64,
    active: bool,
    stop_tx: Option<watch::Sender<bool>>,
}

pub struct RecordingManager {
    records: Mutex<HashMap<String, RecordingRecord>>,
    inputs: Arc<InputRegistry>,
    rtsp: Arc<RtspServer>,
    recordings_dir: PathBuf,
    ffmpeg_path: String,
    events: Arc<EventBroker>,
    tasks: TaskGroup,
    ready_timeout: Duration,
    watcher_cancel: watch::Sender<bool>,
    watcher_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RecordingManager {
    /// Build the manager and start the directory watcher.
    pub fn new(
        inputs: Arc<InputRegistry>,
        rtsp: Arc<RtspServer>,
        recordings_dir: PathBuf,
        ffmpeg_path: String,
        events: Arc<EventBroker>,
        tasks: TaskGroup,
        ready_timeout: Duration,
    ) -> Arc<Self> {
        let (watcher_cancel, cancel_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            inputs,
            rtsp,
            recordings_dir: recordings_dir.clone(),
            ffmpeg_path,
            events: events.clone(),
            tasks: tasks.clone(),
            ready_timeout,
            watcher_cancel,
            watcher_task: std::sync::Mutex::new(None),
        });

        let handle = tasks.spawn(
            "recording-watcher",
            watcher_task(recordings_dir, events, cancel_rx),
        );
        *manager.watcher_task.lock().unwrap() = Some(handle);
        manager
    }

    /// Start recording `source_url` under `name`.
    ///
    /// The record is reserved (active, no file yet) before any slow work so
    /// a concurrent duplicate start loses immediately; every later failure
    /// rolls the reservation back.
    pub async fn start(
        self: &Arc<Self>,
        name: &str,
        source_url: &str,
    ) -> Result<String, RecordingError> {
        source::validate_name(name)?;

        let started_at = Utc::now();
        let key = format!("{}|{}|{}", name, source_url, started_at.timestamp());
        {
            let mut records = self.records.lock().await;
            let duplicate = records
                .values()
                .any(|r| r.active && r.name == name && r.source == source_url);
            if duplicate {
                return Err(RecordingError::AlreadyExists {
                    name: name.to_string(),
                    source_url: source_url.to_string(),
                });
            }
            records.insert(
                key.clone(),
                RecordingRecord {
                    name: name.to_string(),
                    source: source_url.to_string(),
                    file_path: None,
                    started_at,
                    stopped_at: None,
                    file_size: 0,
                    active: true,
                    stop_tx: None,
                },
            );
        }

        match self.bring_up(name, source_url, &key, started_at).await {
            Ok(()) => {
                self.events.notify("update");
                Ok(key)
            }
            Err(e) => {
                self.records.lock().await.remove(&key);
                Err(e)
            }
        }
    }

    /// Attach, wait for readiness, spawn the encoder, finalize the record.
    async fn bring_up(
        self: &Arc<Self>,
        name: &str,
        source_url: &str,
        key: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), RecordingError> {
        let local_url = self.inputs.attach(name, source_url).await?;

        let relay = self
            .inputs
            .get(source_url)
            .await
            .expect("relay exists after attach");
        if !self.rtsp.wait_ready(&relay.rtsp_path(), self.ready_timeout).await {
            self.inputs.detach(source_url).await;
            return Err(RecordingError::InputNotReady(name.to_string()));
        }

        let file_name = format!("{}_{}.mp4", name, started_at.timestamp());
        let file_path = self.recordings_dir.join(&file_name);
        let args = recording_args(&local_url, &file_path);
        let handle = Arc::new(FfmpegHandle::new(self.ffmpeg_path.clone(), args));
        if let Err(e) = handle.start() {
            self.inputs.detach(source_url).await;
            return Err(e.into());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.get_mut(key) {
                record.file_path = Some(file_path.clone());
                record.stop_tx = Some(stop_tx);
            }
        }

        let manager = self.clone();
        let key = key.to_string();
        let source = source_url.to_string();
        self.tasks.spawn("recording-completion", async move {
            completion_task(manager, key, source, handle, file_path, stop_rx).await;
        });

        tracing::info!(name = %name, source = %source_url, "recording started");
        Ok(())
    }

    /// Stop the latest-started active recording matching `(name, source)`.
    /// Stopping an already-finished recording is success, not an error.
    pub async fn stop(
        &self,
        name: &str,
        source_url: &str,
    ) -> Result<StopOutcome, RecordingError> {
        let records = self.records.lock().await;
        let latest_active = records
            .values()
            .filter(|r| r.active && r.name == name && r.source == source_url)
            .max_by_key(|r| r.started_at);

        if let Some(record) = latest_active {
            if let Some(stop_tx) = &record.stop_tx {
                let _ = stop_tx.send(true);
            }
            tracing::info!(name = %name, source = %source_url, "recording stop requested");
            return Ok(StopOutcome::Stopping);
        }

        let finished = records
            .values()
            .any(|r| !r.active && r.name == name && r.source == source_url);
        drop(records);
        if finished {
            self.events.notify("update");
            return Ok(StopOutcome::AlreadyFinished);
        }
        Err(RecordingError::NotFound)
    }

    /// Stop every active recording and wait (bounded) for the files to be
    /// finalized.
    pub async fn stop_all(&self) {
        let targets: Vec<(String, String)> = {
            let records = self.records.lock().await;
            records
                .values()
                .filter(|r| r.active)
                .map(|r| (r.name.clone(), r.source.clone()))
                .collect()
        };
        for (name, source) in &targets {
            let _ = self.stop(name, source).await;
        }

        let deadline = tokio::time::Instant::now() + STOP_ALL_WAIT;
        loop {
            let any_active = self
                .records
                .lock()
                .await
                .values()
                .any(|r| r.active);
            if !any_active {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("recordings still active after stop_all wait");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// All recordings: in-memory records plus on-disk `.mp4` files nobody
    /// remembers, synthesized as inactive entries. Deterministically sorted
    /// (newest first, then by name).
    pub async fn list(&self) -> Vec<Recording> {
        let mut out = Vec::new();
        let mut known_files = std::collections::HashSet::new();

        {
            let records = self.records.lock().await;
            for (key, record) in records.iter() {
                let file_name = record
                    .file_path
                    .as_ref()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned());
                if let Some(ref name) = file_name {
                    known_files.insert(name.clone());
                }
                let file_size = if record.active {
                    record
                        .file_path
                        .as_ref()
                        .and_then(|p| std::fs::metadata(p).ok())
                        .map(|m| m.len())
                        .unwrap_or(0)
                } else {
                    record.file_size
                };
                out.push(Recording {
                    key: key.clone(),
                    name: record.name.clone(),
                    source: record.source.clone(),
                    file_path: record
                        .file_path
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    file_name,
                    file_size,
                    started_at: record.started_at,
                    stopped_at: record.stopped_at,
                    active: record.active,
                });
            }
        }

        if let Ok(entries) = std::fs::read_dir(&self.recordings_dir) {
            for entry in entries.flatten() {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if !file_name.ends_with(".mp4") || known_files.contains(&file_name) {
                    continue;
                }
                let (name, started_at) = parse_recording_filename(&file_name);
                let file_size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                out.push(Recording {
                    key: file_name.clone(),
                    name,
                    source: String::new(),
                    file_path: Some(
                        self.recordings_dir.join(&file_name).display().to_string(),
                    ),
                    file_name: Some(file_name),
                    file_size,
                    started_at,
                    stopped_at: None,
                    active: false,
                });
            }
        }

        out.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.key.cmp(&b.key))
        });
        out
    }

    /// Delete a recording by key or by bare file name. Active recordings
    /// are refused; the file is unlinked and the record dropped.
    pub async fn delete(&self, key_or_filename: &str) -> Result<(), RecordingError> {
        let mut records = self.records.lock().await;

        let matched_key = records
            .iter()
            .find(|(key, record)| {
                key.as_str() == key_or_filename
                    || record
                        .file_path
                        .as_ref()
                        .and_then(|p| p.file_name())
                        .map(|n| n.to_string_lossy() == key_or_filename)
                        .unwrap_or(false)
            })
            .map(|(key, _)| key.clone());

        if let Some(key) = matched_key {
            let record = records.get(&key).expect("matched key exists");
            if record.active {
                return Err(RecordingError::ActiveRecording);
            }
            let file_path = record.file_path.clone();
            if let Some(path) = file_path {
                std::fs::remove_file(&path).map_err(|e| RecordingError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
            }
            records.remove(&key);
            drop(records);
            self.events.notify("update");
            tracing::info!(key = %key, "recording deleted");
            return Ok(());
        }
        drop(records);

        // Disk-only file: must be a plain .mp4 name inside the directory.
        if !key_or_filename.ends_with(".mp4")
            || key_or_filename.contains('/')
            || key_or_filename.contains("..")
        {
            return Err(RecordingError::NotFound);
        }
        let path = self.recordings_dir.join(key_or_filename);
        if !path.is_file() {
            return Err(RecordingError::NotFound);
        }
        std::fs::remove_file(&path).map_err(|e| RecordingError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        self.events.notify("update");
        tracing::info!(file = %key_or_filename, "recording file deleted");
        Ok(())
    }

    /// Resolve a download request to an on-disk path, enforcing the `.mp4`
    /// suffix and directory containment.
    pub fn download_path(&self, filename: &str) -> Option<PathBuf> {
        if !filename.ends_with(".mp4")
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return None;
        }
        let path = self.recordings_dir.join(filename);
        path.is_file().then_some(path)
    }

    /// Stop everything, shut the broker down, and join the watcher.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.events.shutdown();
        let _ = self.watcher_cancel.send(true);
        let handle = self.watcher_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("recording manager shut down");
    }
}

/// Wait for the encoder to exit — naturally or via the stop signal — then
/// finalize the record and release the input reference exactly once.
async fn completion_task(
    manager: Arc<RecordingManager>,
    key: String,
    source: String,
    handle: Arc<FfmpegHandle>,
    file_path: PathBuf,
    mut stop_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = handle.wait_done() => {
            tracing::info!(key = %key, "recording encoder exited");
        }
        _ = stop_rx.changed() => {
            // Interrupt lets the encoder write the MP4 index; escalate only
            // if it hangs past the flush window.
            handle.interrupt();
            if tokio::time::timeout(FLUSH_WAIT, handle.wait_done()).await.is_err() {
                tracing::warn!(key = %key, "recording did not flush in time, escalating");
                handle.stop(FLUSH_ESCALATION_GRACE).await;
            }
        }
    }

    let file_size = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
    {
        let mut records = manager.records.lock().await;
        if let Some(record) = records.get_mut(&key) {
            record.active = false;
            record.stopped_at = Some(Utc::now());
            record.file_size = file_size;
            record.stop_tx = None;
        }
    }
    manager.inputs.detach(&source).await;
    manager.events.notify("update");
    tracing::info!(key = %key, size = file_size, "recording finalized");
}

/// Watch the recordings directory and publish an "update" edge on any
/// create/modify/delete/rename until cancelled.
async fn watcher_task(
    dir: PathBuf,
    events: Arc<EventBroker>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Result<notify::Event>>(16);
    let mut watcher = match notify::recommended_watcher(move |res| {
        let _ = tx.blocking_send(res);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create recordings watcher");
            return;
        }
    };
    if let Err(e) = watcher.watch(&dir, notify::RecursiveMode::NonRecursive) {
        tracing::error!(dir = %dir.display(), error = %e, "failed to watch recordings dir");
        return;
    }
    tracing::debug!(dir = %dir.display(), "recordings watcher running");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        use notify::EventKind;
                        if matches!(
                            event.kind,
                            EventKind::Create(_)
                                | EventKind::Modify(_)
                                | EventKind::Remove(_)
                        ) {
                            events.notify("update");
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "recordings watcher error");
                    }
                    None => break,
                }
            }
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("recordings watcher stopped");
}

/// Recording argument vector: read the relay over RTSP/TCP, stream copy
/// into MP4.
fn recording_args(local_url: &str, file_path: &Path) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-progress",
        "pipe:1",
        "-y",
        "-rtsp_transport",
        "tcp",
        "-i",
        local_url,
        "-c",
        "copy",
        "-movflags",
        "+faststart",
        "-f",
        "mp4",
    ]
    .into_iter()
    .map(String::from)
    .chain([file_path.display().to_string()])
    .collect()
}

/// Recover `(name, started_at)` from a `<name>_<unix>.mp4` file name.
/// Names may themselves contain underscores; the timestamp is the final
/// segment. Unparseable names fall back to the whole stem at epoch zero.
fn parse_recording_filename(file_name: &str) -> (String, DateTime<Utc>) {
    let stem = file_name.trim_end_matches(".mp4");
    if let Some((name, unix)) = stem.rsplit_once('_') {
        if let Ok(ts) = unix.parse::<i64>() {
            if let Some(at) = Utc.timestamp_opt(ts, 0).single() {
                return (name.to_string(), at);
            }
        }
    }
    (
        stem.to_string(),
        Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now),
    )
}
