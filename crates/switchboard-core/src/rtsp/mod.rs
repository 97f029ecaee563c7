//! Embedded RTSP republisher.
//!
//! Ingest encoders publish onto `relay/<input_name>` paths; egress,
//! recording, and HLS encoders read the same paths back. The server speaks
//! TCP-interleaved RTSP only — every leg the supervisor spawns uses
//! `-rtsp_transport tcp` — and enforces at most one publisher per path
//! (a newer `ANNOUNCE` evicts the incumbent).

mod conn;
pub mod sdp;
mod stream;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::tasks::TaskGroup;
use stream::StreamEntry;

/// Publisher-ready polling granularity. Callers are few and tolerate this
/// latency; the contract is explicit readiness, not minimal delay.
const READY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    #[error("failed to bind rtsp server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Status entry for one published path (`GET /api/rtsp/status`).
#[derive(Debug, Clone, Serialize)]
pub struct RtspStreamInfo {
    pub path: String,
    pub ready: bool,
    pub readers: usize,
    /// Announced tracks in compact form, e.g. `video/H264@90000`.
    pub tracks: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub dropped_packets: u64,
}

/// The embedded RTSP server.
pub struct RtspServer {
    streams: Mutex<HashMap<String, Arc<StreamEntry>>>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
    next_conn: AtomicU64,
}

impl RtspServer {
    /// Bind and start accepting connections.
    pub async fn bind(addr: &str, tasks: &TaskGroup) -> Result<Arc<Self>, RtspError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| RtspError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| RtspError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            shutdown_tx,
            local_addr,
            next_conn: AtomicU64::new(0),
        });

        tracing::info!(addr = %local_addr, "rtsp server listening");
        let accept_server = server.clone();
        let conn_tasks = tasks.clone();
        tasks.spawn("rtsp-accept", async move {
            accept_loop(accept_server, listener, shutdown_rx, conn_tasks).await;
        });

        Ok(server)
    }

    /// The bound address (useful when configured with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a publisher for `path`, evicting any incumbent. The prior
    /// publisher's readers are not migrated; they observe a disconnect.
    pub(crate) fn publish(&self, path: &str, sdp: Vec<u8>, conn_id: u64) -> Arc<StreamEntry> {
        let entry = Arc::new(StreamEntry::new(path.to_string(), sdp, conn_id));
        let prior = self
            .streams
            .lock()
            .unwrap()
            .insert(path.to_string(), entry.clone());
        if let Some(prior) = prior {
            tracing::warn!(path = %path, "announce collision, evicting prior publisher");
            prior.evict();
            prior.close_readers();
        }
        entry
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<Arc<StreamEntry>> {
        self.streams.lock().unwrap().get(path).cloned()
    }

    /// Publisher-side cleanup: drop `entry`'s registration unless a newer
    /// publisher already replaced it on the same path.
    pub(crate) fn retire_publisher(&self, entry: &Arc<StreamEntry>) {
        {
            let mut streams = self.streams.lock().unwrap();
            match streams.get(&entry.path) {
                Some(current) if Arc::ptr_eq(current, entry) => {
                    streams.remove(&entry.path);
                    tracing::info!(path = %entry.path, "publisher gone, stream unregistered");
                }
                _ => {}
            }
        }
        entry.evict();
        entry.close_readers();
    }

    /// Wait until `path` has an initialized publisher stream, polling at
    /// coarse granularity. Returns `false` on timeout.
    pub async fn wait_ready(&self, path: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .lookup(path)
                .map(|entry| entry.is_ready())
                .unwrap_or(false)
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Forcibly close and unregister `path`.
    pub fn remove_stream(&self, path: &str) {
        let entry = self.streams.lock().unwrap().remove(path);
        if let Some(entry) = entry {
            tracing::info!(path = %path, "stream removed");
            entry.evict();
            entry.close_readers();
        }
    }

    /// Snapshot of all published paths, sorted for stable output.
    pub fn streams_info(&self) -> Vec<RtspStreamInfo> {
        let mut infos: Vec<_> = self
            .streams
            .lock()
            .unwrap()
            .values()
            .map(|entry| RtspStreamInfo {
                path: entry.path.clone(),
                ready: entry.is_ready(),
                readers: entry.reader_count(),
                tracks: entry.tracks.iter().map(|t| t.label()).collect(),
                created_at: entry.created_at,
                dropped_packets: entry.dropped_packets(),
            })
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        infos
    }

    /// Stop accepting and close every connection and stream.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let entries: Vec<_> = {
            let mut streams = self.streams.lock().unwrap();
            streams.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.evict();
            entry.close_readers();
        }
        tracing::info!("rtsp server stopped");
    }
}

async fn accept_loop(
    server: Arc<RtspServer>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    tasks: TaskGroup,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let _ = socket.set_nodelay(true);
                        let conn_id = server.next_conn.fetch_add(1, Ordering::SeqCst);
                        let conn_server = server.clone();
                        let conn_shutdown = shutdown.clone();
                        tasks.spawn("rtsp-conn", async move {
                            conn::serve(conn_server, conn_id, socket, peer, conn_shutdown).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "rtsp accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("rtsp accept loop finished");
}
