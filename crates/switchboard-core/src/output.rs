//! Output relay registry — one egress encoder per destination URL.
//!
//! Each output reads its input relay's local RTSP URL and pushes to a
//! remote sink. The registry never touches the input refcount itself;
//! instead the coordinator registers a failure callback, and the contract
//! is precise: an *unexpected* exit fires the callback (so the coordinator
//! drops the input reference the dead consumer held), a *graceful* stop
//! suppresses it (the coordinator detaches explicitly), and `delete`
//! always fires it (the consumer is gone either way).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use switchboard_common::EncoderOptions;

use crate::ffmpeg::{FfmpegError, FfmpegHandle};
use crate::input::RelayState;
use crate::tasks::TaskGroup;

/// Grace on an explicit stop.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// Shorter grace when the output is being deleted outright.
const DELETE_GRACE: Duration = Duration::from_secs(1);

/// Invoked with `(input_url, output_url)` when an output stops consuming
/// its input outside a graceful stop.
pub type FailureCallback = Arc<dyn Fn(String, String) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error(transparent)]
    Spawn(#[from] FfmpegError),
}

/// Everything needed to start one egress encoder.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Source URL of the input relay this output consumes (callback key).
    pub input_url: String,
    /// Local RTSP URL to read from.
    pub local_url: String,
    /// Destination URL — the identity of the output.
    pub output_url: String,
    pub output_name: String,
    /// Resolved encoder options (preset already merged in).
    pub options: EncoderOptions,
    /// Preset name as declared, for status/export display.
    pub preset: Option<String>,
}

/// Snapshot of one output relay.
#[derive(Debug, Clone, Serialize)]
pub struct OutputStatus {
    pub output_url: String,
    pub output_name: String,
    pub input_url: String,
    pub state: RelayState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<f64>,
}

struct OutputInner {
    state: RelayState,
    proc: Option<Arc<FfmpegHandle>>,
    last_error: Option<String>,
    shutting_down: bool,
}

/// One egress relay record.
pub struct OutputRelay {
    pub config: OutputConfig,
    inner: Mutex<OutputInner>,
}

impl OutputRelay {
    pub async fn status(&self) -> OutputStatus {
        let inner = self.inner.lock().await;
        let proc = inner.proc.as_ref();
        OutputStatus {
            output_url: self.config.output_url.clone(),
            output_name: self.config.output_name.clone(),
            input_url: self.config.input_url.clone(),
            state: inner.state,
            pid: proc.and_then(|p| p.pid()),
            started_at: proc.and_then(|p| p.started_at()),
            preset: self.config.preset.clone(),
            last_error: inner.last_error.clone(),
            speed: proc.and_then(|p| p.speed()).map(|s| s.value),
            bitrate_kbps: proc.and_then(|p| p.bitrate_kbps()).map(|s| s.value),
        }
    }

    pub async fn state(&self) -> RelayState {
        self.inner.lock().await.state
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.proc.as_ref().and_then(|p| p.pid())
    }
}

/// Registry of egress encoders, keyed by destination URL.
pub struct OutputRegistry {
    outputs: Mutex<HashMap<String, Arc<OutputRelay>>>,
    ffmpeg_path: String,
    tasks: TaskGroup,
    on_failure: std::sync::Mutex<Option<FailureCallback>>,
}

impl OutputRegistry {
    pub fn new(ffmpeg_path: String, tasks: TaskGroup) -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            ffmpeg_path,
            tasks,
            on_failure: std::sync::Mutex::new(None),
        }
    }

    /// Register the coordinator's failure callback.
    pub fn set_failure_callback(&self, cb: FailureCallback) {
        *self.on_failure.lock().unwrap() = Some(cb);
    }

    fn fire_failure(&self, input_url: &str, output_url: &str) {
        let cb = self.on_failure.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(input_url.to_string(), output_url.to_string());
        }
    }

    /// Start the egress encoder for `config`. A destination that is already
    /// Running is a no-op.
    pub async fn start(self: &Arc<Self>, config: OutputConfig) -> Result<(), OutputError> {
        let relay = {
            let mut outputs = self.outputs.lock().await;
            if let Some(existing) = outputs.get(&config.output_url) {
                if matches!(
                    existing.state().await,
                    RelayState::Starting | RelayState::Running
                ) {
                    tracing::info!(
                        output = %config.output_url,
                        "output already running, start is a no-op"
                    );
                    return Ok(());
                }
            }
            let relay = Arc::new(OutputRelay {
                config: config.clone(),
                inner: Mutex::new(OutputInner {
                    state: RelayState::Starting,
                    proc: None,
                    last_error: None,
                    shutting_down: false,
                }),
            });
            outputs.insert(config.output_url.clone(), relay.clone());
            relay
        };

        let args = egress_args(&config.local_url, &config.output_url, &config.options);
        let handle = Arc::new(FfmpegHandle::new(self.ffmpeg_path.clone(), args));
        if let Err(e) = handle.start() {
            let mut inner = relay.inner.lock().await;
            inner.state = RelayState::Error;
            inner.last_error = Some(e.to_string());
            tracing::error!(output = %config.output_url, error = %e, "egress spawn failed");
            return Err(e.into());
        }

        {
            let mut inner = relay.inner.lock().await;
            inner.proc = Some(handle.clone());
            inner.state = RelayState::Running;
        }

        let registry = self.clone();
        let monitor_relay = relay.clone();
        self.tasks.spawn("output-monitor", async move {
            monitor_task(registry, monitor_relay, handle).await;
        });

        tracing::info!(
            output = %config.output_url,
            name = %config.output_name,
            input = %config.input_url,
            "egress encoder started"
        );
        Ok(())
    }

    /// Graceful stop: the failure callback is suppressed — the caller is
    /// responsible for the matching input detach. Returns `false` when the
    /// output is unknown or already terminal (a terminal output's input
    /// reference was released on its way down; stopping it again must not
    /// release another).
    pub async fn stop(&self, output_url: &str) -> bool {
        let Some(relay) = self.outputs.lock().await.get(output_url).cloned() else {
            return false;
        };
        let proc = {
            let mut inner = relay.inner.lock().await;
            if !matches!(inner.state, RelayState::Starting | RelayState::Running) {
                return false;
            }
            inner.shutting_down = true;
            inner.state = RelayState::Stopped;
            inner.proc.take()
        };
        if let Some(proc) = proc {
            proc.stop(STOP_GRACE).await;
        }
        tracing::info!(output = %output_url, "egress stopped");
        true
    }

    /// Remove the output entirely. Always fires the failure callback so the
    /// coordinator drops the input reference this consumer held.
    pub async fn delete(&self, output_url: &str) -> bool {
        let removed = self.outputs.lock().await.remove(output_url);
        let Some(relay) = removed else {
            return false;
        };
        let proc = {
            let mut inner = relay.inner.lock().await;
            inner.shutting_down = true;
            inner.state = RelayState::Stopped;
            inner.proc.take()
        };
        if let Some(proc) = proc {
            proc.stop(DELETE_GRACE).await;
        }
        self.fire_failure(&relay.config.input_url, output_url);
        tracing::info!(output = %output_url, "output deleted");
        true
    }

    pub async fn get(&self, output_url: &str) -> Option<Arc<OutputRelay>> {
        self.outputs.lock().await.get(output_url).cloned()
    }

    /// Destination URLs of outputs consuming `input_url`.
    pub async fn outputs_for_input(&self, input_url: &str) -> Vec<String> {
        let outputs = self.outputs.lock().await;
        let mut urls: Vec<_> = outputs
            .values()
            .filter(|o| o.config.input_url == input_url)
            .map(|o| o.config.output_url.clone())
            .collect();
        urls.sort();
        urls
    }

    pub async fn statuses(&self) -> Vec<OutputStatus> {
        let relays: Vec<_> = {
            let outputs = self.outputs.lock().await;
            outputs.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(relays.len());
        for relay in relays {
            out.push(relay.status().await);
        }
        out.sort_by(|a, b| a.output_url.cmp(&b.output_url));
        out
    }

    /// Stop every output gracefully (shutdown path; callbacks suppressed).
    pub async fn stop_all(&self) {
        let urls: Vec<_> = {
            let outputs = self.outputs.lock().await;
            outputs.keys().cloned().collect()
        };
        for url in urls {
            self.stop(&url).await;
        }
    }
}

/// Classify the egress encoder's exit. Graceful stops were already marked
/// by `stop`/`delete`; anything else is an unexpected failure that must
/// release the input reference via the callback.
async fn monitor_task(
    registry: Arc<OutputRegistry>,
    relay: Arc<OutputRelay>,
    handle: Arc<FfmpegHandle>,
) {
    let status = handle.wait_done().await;

    let unexpected = {
        let mut inner = relay.inner.lock().await;
        if inner.shutting_down {
            inner.state = RelayState::Stopped;
            false
        } else {
            let tail = handle.output_tail(10);
            inner.state = RelayState::Error;
            inner.last_error =
                Some(format!("encoder exited unexpectedly ({status}): {tail}"));
            tracing::error!(
                output = %relay.config.output_url,
                %status,
                tail = %tail,
                "egress encoder exited unexpectedly"
            );
            true
        }
    };

    if unexpected {
        registry.fire_failure(&relay.config.input_url, &relay.config.output_url);
    }
}

/// Egress argument vector: read the local relay over RTSP/TCP, apply the
/// resolved options (absent fields mean stream copy / source geometry), and
/// pick the container by destination scheme.
fn egress_args(local_url: &str, output_url: &str, options: &EncoderOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-progress",
        "pipe:1",
        "-rtsp_transport",
        "tcp",
        "-i",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    args.push(local_url.to_string());

    match &options.video_codec {
        Some(codec) => args.extend(["-c:v".into(), codec.clone()]),
        None => args.extend(["-c:v".into(), "copy".into()]),
    }
    match &options.audio_codec {
        Some(codec) => args.extend(["-c:a".into(), codec.clone()]),
        None => args.extend(["-c:a".into(), "copy".into()]),
    }
    if let Some(resolution) = &options.resolution {
        args.extend(["-s".into(), resolution.clone()]);
    }
    if let Some(framerate) = &options.framerate {
        args.extend(["-r".into(), framerate.clone()]);
    }
    if let Some(bitrate) = &options.bitrate {
        args.extend(["-b:v".into(), bitrate.clone()]);
    }
    if let Some(rotation) = &options.rotation {
        args.extend(["-metadata:s:v".into(), format!("rotate={rotation}")]);
    }

    if output_url.starts_with("rtmp://") || output_url.starts_with("rtmps://") {
        args.extend(["-f".into(), "flv".into()]);
    } else if output_url.starts_with("rtsp://") {
        args.extend(["-f".into(), "rtsp".into(), "-rtsp_transport".into(), "tcp".into()]);
    }
    args.push(output_url.to_string());
    args
}
