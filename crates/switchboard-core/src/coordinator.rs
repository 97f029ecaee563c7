//! Relay coordinator — composes the input and output registries.
//!
//! A *relay* from the operator's point of view is one `(input, output)`
//! declaration: ingest this source, push it to that destination. The
//! coordinator owns the declaration set (persisted via export/import),
//! sequences attach → wait-ready → output-start with rollback on every
//! failure path, and wires the output registry's failure callback back
//! into the input refcount.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use switchboard_common::presets::{self, PresetError};
use switchboard_common::EncoderOptions;

use crate::input::{InputError, InputRegistry, InputStatus};
use crate::output::{OutputConfig, OutputError, OutputRegistry, OutputStatus};
use crate::procstat::{self, ProcessMetrics};
use crate::rtsp::RtspServer;
use crate::tasks::TaskGroup;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Preset(#[from] PresetError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("input {input_name} did not become ready within {timeout:?}")]
    InputNotReady {
        input_name: String,
        timeout: Duration,
    },
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("no relay declared for output {0}")]
    UnknownRelay(String),
    #[error("failed to read declarations from {path}: {source}")]
    ImportRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid declarations in {path}: {source}")]
    ImportParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write declarations to {path}: {source}")]
    ExportWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One declared relay: the user-visible unit persisted by export/import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RelayDeclaration {
    pub input_url: String,
    pub output_url: String,
    pub input_name: String,
    pub output_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffmpeg_options: Option<EncoderOptions>,
}

impl RelayDeclaration {
    pub fn key(&self) -> String {
        format!("{}|{}", self.input_url, self.output_url)
    }
}

/// Full status snapshot for `GET /api/relay/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub inputs: Vec<InputStatus>,
    pub outputs: Vec<OutputStatus>,
    pub processes: Vec<ProcessMetrics>,
}

pub struct Coordinator {
    inputs: Arc<InputRegistry>,
    outputs: Arc<OutputRegistry>,
    rtsp: Arc<RtspServer>,
    input_timeout: Duration,
    declarations: Mutex<HashMap<String, RelayDeclaration>>,
}

impl Coordinator {
    /// Wire the registries together. Registers the failure callback that
    /// releases an input reference whenever an output stops consuming it
    /// outside a graceful stop.
    pub fn new(
        inputs: Arc<InputRegistry>,
        outputs: Arc<OutputRegistry>,
        rtsp: Arc<RtspServer>,
        input_timeout: Duration,
        tasks: &TaskGroup,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            rtsp,
            input_timeout,
            declarations: Mutex::new(HashMap::new()),
        });

        let cb_inputs = inputs;
        let cb_tasks = tasks.clone();
        outputs.set_failure_callback(Arc::new(move |input_url, output_url| {
            let inputs = cb_inputs.clone();
            cb_tasks.spawn("output-failure-detach", async move {
                tracing::warn!(
                    input = %input_url,
                    output = %output_url,
                    "output gone, releasing its input reference"
                );
                inputs.detach(&input_url).await;
            });
        }));

        coordinator
    }

    /// Declare and start one relay. Holds exactly one input reference per
    /// output; every failure path rolls that reference back.
    pub async fn start_relay(&self, decl: RelayDeclaration) -> Result<(), CoordinatorError> {
        let options = presets::resolve(
            decl.platform_preset.as_deref(),
            decl.ffmpeg_options.as_ref(),
        )?;

        let local_url = self
            .inputs
            .attach(&decl.input_name, &decl.input_url)
            .await?;

        let path = format!("relay/{}", decl.input_name);
        if !self.rtsp.wait_ready(&path, self.input_timeout).await {
            // The wait can expire in the same instant the publisher lands;
            // one final check decides whether this is a real failure.
            if self.rtsp.wait_ready(&path, Duration::ZERO).await {
                tracing::warn!(
                    input = %decl.input_name,
                    "ready-wait timed out but stream is up, continuing"
                );
            } else {
                self.inputs.detach(&decl.input_url).await;
                return Err(CoordinatorError::InputNotReady {
                    input_name: decl.input_name.clone(),
                    timeout: self.input_timeout,
                });
            }
        }

        let config = OutputConfig {
            input_url: decl.input_url.clone(),
            local_url,
            output_url: decl.output_url.clone(),
            output_name: decl.output_name.clone(),
            options,
            preset: decl.platform_preset.clone(),
        };
        if let Err(e) = self.outputs.start(config).await {
            self.inputs.detach(&decl.input_url).await;
            return Err(e.into());
        }

        self.declarations
            .lock()
            .await
            .insert(decl.key(), decl.clone());
        tracing::info!(
            input = %decl.input_url,
            output = %decl.output_url,
            "relay started"
        );
        Ok(())
    }

    /// Graceful stop of one relay: the output stops with its callback
    /// suppressed, then the input reference is released exactly once. The
    /// declaration stays (a stopped relay is still declared).
    pub async fn stop_relay(
        &self,
        input_url: &str,
        output_url: &str,
    ) -> Result<(), CoordinatorError> {
        if !self.outputs.stop(output_url).await {
            return Err(CoordinatorError::UnknownRelay(output_url.to_string()));
        }
        self.inputs.detach(input_url).await;
        tracing::info!(input = %input_url, output = %output_url, "relay stopped");
        Ok(())
    }

    /// Delete an input and every output fed by it.
    pub async fn delete_input(&self, input_url: &str) -> Result<(), CoordinatorError> {
        for output_url in self.outputs.outputs_for_input(input_url).await {
            // Each delete fires the callback, releasing that output's
            // input reference.
            self.outputs.delete(&output_url).await;
        }
        self.inputs.delete(input_url).await;

        let mut declarations = self.declarations.lock().await;
        declarations.retain(|_, d| d.input_url != input_url);
        tracing::info!(input = %input_url, "input and its outputs deleted");
        Ok(())
    }

    /// Delete one output; its callback releases the input reference.
    pub async fn delete_output(&self, output_url: &str) -> Result<(), CoordinatorError> {
        if !self.outputs.delete(output_url).await {
            return Err(CoordinatorError::UnknownRelay(output_url.to_string()));
        }
        let mut declarations = self.declarations.lock().await;
        declarations.retain(|_, d| d.output_url != output_url);
        Ok(())
    }

    /// Snapshot every relay plus the supervisor's own process metrics.
    pub async fn status(&self) -> StatusReport {
        StatusReport {
            inputs: self.inputs.statuses().await,
            outputs: self.outputs.statuses().await,
            processes: procstat::process_metrics(),
        }
    }

    pub async fn declarations(&self) -> HashMap<String, RelayDeclaration> {
        self.declarations.lock().await.clone()
    }

    /// Replace the declaration set. Running relays are unaffected until
    /// explicitly restarted.
    pub async fn replace_declarations(&self, decls: HashMap<String, RelayDeclaration>) {
        let mut declarations = self.declarations.lock().await;
        *declarations = decls;
        tracing::info!(count = declarations.len(), "declaration set replaced");
    }

    /// Persist the declaration set as JSON.
    pub async fn export(&self, path: impl AsRef<Path>) -> Result<(), CoordinatorError> {
        let path = path.as_ref();
        let declarations = self.declarations().await;
        let json = serde_json::to_string_pretty(&declarations)
            .expect("declaration serialization is infallible");
        std::fs::write(path, json).map_err(|e| CoordinatorError::ExportWrite {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Load a declaration set from JSON, replacing the live set.
    pub async fn import(&self, path: impl AsRef<Path>) -> Result<(), CoordinatorError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| CoordinatorError::ImportRead {
            path: path.display().to_string(),
            source: e,
        })?;
        let decls: HashMap<String, RelayDeclaration> =
            serde_json::from_str(&raw).map_err(|e| CoordinatorError::ImportParse {
                path: path.display().to_string(),
                source: e,
            })?;
        self.replace_declarations(decls).await;
        Ok(())
    }

    /// Shutdown path: stop every output gracefully, then force every input
    /// down regardless of refcount.
    pub async fn stop_all_relays(&self) {
        self.outputs.stop_all().await;
        for source_url in self.inputs.source_urls().await {
            self.inputs.force_detach(&source_url).await;
        }
        tracing::info!("all relays stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_publisher, stub_encoder};

    struct Fixture {
        coordinator: Arc<Coordinator>,
        inputs: Arc<InputRegistry>,
        rtsp: Arc<RtspServer>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(ready_timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = stub_encoder(dir.path());
        let tasks = TaskGroup::new();
        let rtsp = RtspServer::bind("127.0.0.1:0", &tasks).await.unwrap();
        let inputs = Arc::new(InputRegistry::new(
            rtsp.clone(),
            rtsp.local_addr().to_string(),
            dir.path().to_path_buf(),
            ffmpeg.clone(),
            tasks.clone(),
        ));
        let outputs = Arc::new(OutputRegistry::new(ffmpeg, tasks.clone()));
        let coordinator = Coordinator::new(
            inputs.clone(),
            outputs,
            rtsp.clone(),
            ready_timeout,
            &tasks,
        );
        Fixture {
            coordinator,
            inputs,
            rtsp,
            _dir: dir,
        }
    }

    fn decl(input: &str, output: &str, name: &str) -> RelayDeclaration {
        RelayDeclaration {
            input_url: input.into(),
            output_url: output.into(),
            input_name: name.into(),
            output_name: "sink".into(),
            platform_preset: None,
            ffmpeg_options: None,
        }
    }

    #[tokio::test]
    async fn ready_timeout_rolls_back_the_attach() {
        let f = fixture(Duration::from_millis(300)).await;

        // The stub ingest never publishes, so readiness must time out.
        let err = f
            .coordinator
            .start_relay(decl("rtsp://a/x", "rtmp://b/live", "x"))
            .await;
        assert!(matches!(err, Err(CoordinatorError::InputNotReady { .. })));

        let relay = f.inputs.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.refcount().await, 0);
        assert!(f.coordinator.declarations().await.is_empty());
    }

    #[tokio::test]
    async fn start_relay_attaches_waits_and_starts_output() {
        let f = fixture(Duration::from_secs(5)).await;

        // Stand in for the ingest encoder's publish leg.
        let _pub = fake_publisher(f.rtsp.local_addr(), "relay/x").await;

        f.coordinator
            .start_relay(decl("rtsp://a/x", "rtmp://b/live", "x"))
            .await
            .unwrap();

        let relay = f.inputs.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.refcount().await, 1);

        let report = f.coordinator.status().await;
        assert_eq!(report.inputs.len(), 1);
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].output_url, "rtmp://b/live");
        assert!(!report.processes.is_empty());

        assert_eq!(f.coordinator.declarations().await.len(), 1);
        f.coordinator.stop_all_relays().await;
    }

    #[tokio::test]
    async fn two_outputs_share_one_input() {
        let f = fixture(Duration::from_secs(5)).await;
        let _pub = fake_publisher(f.rtsp.local_addr(), "relay/x").await;

        f.coordinator
            .start_relay(decl("rtsp://a/x", "rtmp://b/1", "x"))
            .await
            .unwrap();
        f.coordinator
            .start_relay(decl("rtsp://a/x", "rtmp://b/2", "x"))
            .await
            .unwrap();

        let relay = f.inputs.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.refcount().await, 2);
        let ingest_pid = relay.pid().await.unwrap();

        // Dropping one output keeps the shared ingest alive.
        f.coordinator.delete_output("rtmp://b/1").await.unwrap();
        wait_for_refcount(&f.inputs, "rtsp://a/x", 1).await;
        assert_eq!(relay.pid().await, Some(ingest_pid));

        // Dropping the last output tears the ingest down.
        f.coordinator.delete_output("rtmp://b/2").await.unwrap();
        wait_for_refcount(&f.inputs, "rtsp://a/x", 0).await;
        assert_eq!(relay.pid().await, None);
    }

    async fn wait_for_refcount(inputs: &Arc<InputRegistry>, url: &str, want: u32) {
        let relay = inputs.get(url).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while relay.refcount().await != want {
            assert!(
                tokio::time::Instant::now() < deadline,
                "refcount never reached {want}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn stop_relay_detaches_exactly_once() {
        let f = fixture(Duration::from_secs(5)).await;
        let _pub = fake_publisher(f.rtsp.local_addr(), "relay/x").await;

        f.coordinator
            .start_relay(decl("rtsp://a/x", "rtmp://b/live", "x"))
            .await
            .unwrap();
        f.coordinator
            .stop_relay("rtsp://a/x", "rtmp://b/live")
            .await
            .unwrap();

        let relay = f.inputs.get("rtsp://a/x").await.unwrap();
        assert_eq!(relay.refcount().await, 0);
        // Still declared after a stop.
        assert_eq!(f.coordinator.declarations().await.len(), 1);

        // A second stop has no output to stop.
        assert!(f
            .coordinator
            .stop_relay("rtsp://a/x", "rtmp://b/live")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delete_input_removes_all_its_outputs() {
        let f = fixture(Duration::from_secs(5)).await;
        let _pub = fake_publisher(f.rtsp.local_addr(), "relay/x").await;

        f.coordinator
            .start_relay(decl("rtsp://a/x", "rtmp://b/1", "x"))
            .await
            .unwrap();
        f.coordinator
            .start_relay(decl("rtsp://a/x", "rtmp://b/2", "x"))
            .await
            .unwrap();

        f.coordinator.delete_input("rtsp://a/x").await.unwrap();
        assert!(f.inputs.get("rtsp://a/x").await.is_none());
        assert!(f.coordinator.declarations().await.is_empty());
        assert!(f.coordinator.status().await.outputs.is_empty());
    }

    #[tokio::test]
    async fn export_import_round_trip() {
        let f = fixture(Duration::from_millis(100)).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays.json");

        let mut decls = HashMap::new();
        let d = RelayDeclaration {
            input_url: "rtsp://a/x".into(),
            output_url: "rtmp://b/live".into(),
            input_name: "x".into(),
            output_name: "b1".into(),
            platform_preset: Some("youtube".into()),
            ffmpeg_options: Some(EncoderOptions {
                bitrate: Some("6000k".into()),
                ..Default::default()
            }),
        };
        decls.insert(d.key(), d);
        f.coordinator.replace_declarations(decls.clone()).await;

        f.coordinator.export(&path).await.unwrap();
        f.coordinator.replace_declarations(HashMap::new()).await;
        f.coordinator.import(&path).await.unwrap();

        assert_eq!(f.coordinator.declarations().await, decls);
    }

    #[tokio::test]
    async fn replacing_declarations_leaves_running_relays_alone() {
        let f = fixture(Duration::from_secs(5)).await;
        let _pub = fake_publisher(f.rtsp.local_addr(), "relay/x").await;

        f.coordinator
            .start_relay(decl("rtsp://a/x", "rtmp://b/live", "x"))
            .await
            .unwrap();
        let relay = f.inputs.get("rtsp://a/x").await.unwrap();
        let pid = relay.pid().await.unwrap();

        f.coordinator.replace_declarations(HashMap::new()).await;

        assert_eq!(relay.refcount().await, 1);
        assert_eq!(relay.pid().await, Some(pid));
        assert_eq!(f.coordinator.status().await.outputs.len(), 1);

        f.coordinator.stop_all_relays().await;
    }

    #[tokio::test]
    async fn import_of_invalid_file_fails() {
        let f = fixture(Duration::from_millis(100)).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays.json");
        std::fs::write(&path, "{broken").unwrap();

        assert!(matches!(
            f.coordinator.import(&path).await,
            Err(CoordinatorError::ImportParse { .. })
        ));
        assert!(matches!(
            f.coordinator.import(dir.path().join("missing.json")).await,
            Err(CoordinatorError::ImportRead { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_preset_fails_before_any_attach() {
        let f = fixture(Duration::from_millis(100)).await;
        let mut d = decl("rtsp://a/x", "rtmp://b/live", "x");
        d.platform_preset = Some("myspace".into());

        assert!(matches!(
            f.coordinator.start_relay(d).await,
            Err(CoordinatorError::Preset(_))
        ));
        // Nothing was attached.
        assert!(f.inputs.get("rtsp://a/x").await.is_none());
    }
}
