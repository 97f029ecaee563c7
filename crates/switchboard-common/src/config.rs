//! JSON configuration file.
//!
//! A missing file yields the built-in defaults; a present file may specify
//! any subset of sections and fields — everything omitted falls back to its
//! default. Timeouts are in seconds; `0` means "no timeout" where noted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub http: HttpConfig,
    pub relay: RelayConfig,
    pub recording: RecordingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Request read timeout in seconds.
    pub read_timeout: u64,
    /// Response write timeout in seconds. `0` disables it (required for the
    /// long-lived SSE event stream).
    pub write_timeout: u64,
    pub idle_timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            read_timeout: 15,
            write_timeout: 0,
            idle_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// How long to wait for an ingested source to become ready on the local
    /// RTSP server before an output/recording/HLS leg gives up.
    pub input_timeout: u64,
    pub output_timeout: u64,
    pub rtsp_server: RtspServerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            input_timeout: 30,
            output_timeout: 30,
            rtsp_server: RtspServerConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_secs(self.input_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RtspServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RtspServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8554,
        }
    }
}

impl RtspServerConfig {
    /// Socket address string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    pub directory: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: "recordings".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default tracing filter (overridden by `RUST_LOG`, raised to `debug`
    /// by `SWITCHBOARD_DEBUG=1`).
    pub level: String,
    /// Optional log file path. `null` logs to stderr only.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from `path`. A missing file is not an error — the
    /// defaults apply. A present-but-invalid file is a hard error so a typo
    /// never silently reverts the deployment to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}
