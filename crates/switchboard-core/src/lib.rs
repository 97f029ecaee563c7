//! switchboard-core — the relay fabric.
//!
//! Everything between the HTTP surface and the encoder children lives
//! here:
//!
//! - [`ffmpeg`] — single-use encoder process handles
//! - [`rtsp`] — the embedded RTSP republisher
//! - [`input`] — refcounted ingest relays (one encoder per source URL)
//! - [`output`] — egress relays with failure callbacks
//! - [`coordinator`] — declared relays, status, export/import
//! - [`recording`] — MP4 captures + directory watcher
//! - [`hls`] — HLS viewer sessions with heartbeats and eviction
//! - [`events`] — bounded drop-on-full change notifications
//! - [`tasks`] — named task accounting for the shutdown report

pub mod coordinator;
pub mod events;
pub mod ffmpeg;
pub mod hls;
pub mod input;
pub mod output;
pub mod procstat;
pub mod recording;
pub mod rtsp;
pub mod source;
pub mod tasks;
pub mod test_support;

pub use coordinator::{Coordinator, RelayDeclaration, StatusReport};
pub use events::EventBroker;
pub use hls::HlsManager;
pub use input::InputRegistry;
pub use output::OutputRegistry;
pub use recording::RecordingManager;
pub use rtsp::RtspServer;
pub use tasks::TaskGroup;
