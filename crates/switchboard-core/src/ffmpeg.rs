//! Encoder process handle — spawns and observes one ffmpeg child.
//!
//! The handle is single-use: construct, `start()`, observe, `stop()`. A new
//! child needs a new handle. The child runs in its own process group so an
//! interactive Ctrl-C against the supervisor never reaches the encoders;
//! every signal the supervisor delivers is explicit and group-wide.
//!
//! Exactly one `wait(2)` is ever issued against the child (by the internal
//! reaper task); the exit status is re-broadcast through a watch channel so
//! any number of observers can `wait_done()` and all see the same result.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

/// Lines of child output retained for error reporting.
const OUTPUT_TAIL_CAP: usize = 120;

/// Bound on the post-SIGKILL reap wait inside [`FfmpegHandle::stop`].
const KILL_REAP_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoder process already started")]
    AlreadyStarted,
    #[error("encoder process not started")]
    NotStarted,
}

/// A timestamped progress sample parsed from the encoder's progress stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Progress {
    speed: Option<Sample>,
    bitrate_kbps: Option<Sample>,
}

/// Handle to one encoder child process.
pub struct FfmpegHandle {
    program: String,
    args: Vec<String>,
    started: AtomicBool,
    pid: Mutex<Option<u32>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    progress: Arc<Mutex<Progress>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl FfmpegHandle {
    /// Build a handle from an argument vector. Nothing is spawned yet.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            program: program.into(),
            args,
            started: AtomicBool::new(false),
            pid: Mutex::new(None),
            started_at: Mutex::new(None),
            progress: Arc::new(Mutex::new(Progress::default())),
            tail: Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_CAP))),
            exit_tx,
            exit_rx,
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap()
    }

    /// Spawn the child and the observer tasks. Fails if the binary cannot be
    /// executed; the handle is then spent (single-use).
    pub fn start(&self) -> Result<(), FfmpegError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FfmpegError::AlreadyStarted);
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // New session: the child leads its own process group, so terminal
        // signals to the supervisor do not propagate and group-wide kills
        // reach any helpers the encoder forks.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| FfmpegError::Spawn {
            program: self.program.clone(),
            source: e,
        })?;

        let pid = child.id();
        *self.pid.lock().unwrap() = pid;
        *self.started_at.lock().unwrap() = Some(Utc::now());
        tracing::debug!(program = %self.program, pid = ?pid, "encoder spawned");

        // The progress sink (when requested in the args) writes key=value
        // lines to stdout; everything else is diagnostics for the tail.
        let parse_progress = self.args.iter().any(|a| a == "-progress");

        if let Some(stdout) = child.stdout.take() {
            let progress = self.progress.clone();
            let tail = self.tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if parse_progress {
                        parse_progress_line(&line, &progress);
                    } else {
                        push_tail(&tail, line);
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let tail = self.tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_tail(&tail, line);
                }
            });
        }

        // Reaper: the single wait() against the child. Its result fans out
        // through the watch channel to every observer.
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let _ = exit_tx.send(Some(status));
                }
                Err(e) => {
                    tracing::error!(error = %e, "wait on encoder child failed");
                    // Observers must still unblock; synthesize a failure.
                    let _ = exit_tx.send(Some(fail_status()));
                }
            }
        });

        Ok(())
    }

    /// Wait for the child to exit. Safe for any number of concurrent
    /// callers; all see the same exit status.
    pub async fn wait_done(&self) -> ExitStatus {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(status) = *rx.borrow_and_update() {
                return status;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without a status — treat as failed.
                return fail_status();
            }
        }
    }

    /// True once the child has exited (without blocking).
    pub fn is_done(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Terminate the child: SIGTERM to the process group, escalating to
    /// SIGKILL after `grace`. Never blocks longer than `grace` plus a small
    /// bounded reap wait.
    pub async fn stop(&self, grace: Duration) {
        let Some(pid) = self.pid() else { return };
        if self.is_done() {
            return;
        }

        tracing::debug!(pid, grace_ms = grace.as_millis() as u64, "stopping encoder");
        signal_group(pid, libc::SIGTERM);

        if tokio::time::timeout(grace, self.wait_done()).await.is_ok() {
            return;
        }

        tracing::warn!(pid, "encoder ignored SIGTERM, killing");
        signal_group(pid, libc::SIGKILL);
        let _ = tokio::time::timeout(KILL_REAP_WAIT, self.wait_done()).await;
    }

    /// Send SIGINT only. Used for recordings, where the encoder traps the
    /// interrupt and finalizes the MP4 index before exiting.
    pub fn interrupt(&self) {
        if let Some(pid) = self.pid() {
            if !self.is_done() {
                signal_group(pid, libc::SIGINT);
            }
        }
    }

    /// Immediate SIGKILL to the group, no grace.
    pub fn kill(&self) {
        if let Some(pid) = self.pid() {
            if !self.is_done() {
                signal_group(pid, libc::SIGKILL);
            }
        }
    }

    /// Last parsed `speed=` sample.
    pub fn speed(&self) -> Option<Sample> {
        self.progress.lock().unwrap().speed
    }

    /// Last parsed `bitrate=` sample, in kbit/s.
    pub fn bitrate_kbps(&self) -> Option<Sample> {
        self.progress.lock().unwrap().bitrate_kbps
    }

    /// The last `n` lines of diagnostic output, newline-joined.
    pub fn output_tail(&self, n: usize) -> String {
        let tail = self.tail.lock().unwrap();
        let skip = tail.len().saturating_sub(n);
        tail.iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Deliver `sig` to the whole process group led by `pid`.
fn signal_group(pid: u32, sig: i32) {
    // setsid in pre_exec makes the child its own group leader, so -pid
    // addresses the group.
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

/// A synthetic non-zero exit status for when the real one is unobtainable.
fn fail_status() -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(1 << 8)
}

fn push_tail(tail: &Mutex<VecDeque<String>>, line: String) {
    let mut tail = tail.lock().unwrap();
    if tail.len() == OUTPUT_TAIL_CAP {
        tail.pop_front();
    }
    tail.push_back(line);
}

/// Parse one `key=value` progress line. Unknown keys and `N/A` values are
/// ignored.
fn parse_progress_line(line: &str, progress: &Mutex<Progress>) {
    let Some((key, value)) = line.trim().split_once('=') else {
        return;
    };
    let value = value.trim();
    if value == "N/A" {
        return;
    }
    match key {
        "speed" => {
            if let Ok(v) = value.trim_end_matches('x').parse::<f64>() {
                progress.lock().unwrap().speed = Some(Sample {
                    value: v,
                    at: Utc::now(),
                });
            }
        }
        "bitrate" => {
            if let Ok(v) = value.trim_end_matches("kbits/s").parse::<f64>() {
                progress.lock().unwrap().bitrate_kbps = Some(Sample {
                    value: v,
                    at: Utc::now(),
                });
            }
        }
        _ => {}
    }
}
