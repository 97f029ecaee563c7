//! Per-path publisher stream state and reader fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use super::sdp::{self, TrackInfo};

/// Packets buffered per reader before drops start. Readers that fall this
/// far behind lose packets rather than stalling the publisher.
const READER_QUEUE: usize = 256;

/// One published path: the announced SDP plus the attached readers.
pub struct StreamEntry {
    pub path: String,
    pub sdp: Vec<u8>,
    pub tracks: Vec<TrackInfo>,
    pub created_at: DateTime<Utc>,
    /// Connection id of the owning publisher; used so a stale publisher's
    /// cleanup cannot tear down a replacement stream on the same path.
    pub publisher_conn: u64,
    ready: AtomicBool,
    evict_tx: watch::Sender<bool>,
    evict_rx: watch::Receiver<bool>,
    readers: Mutex<HashMap<u64, mpsc::Sender<Bytes>>>,
    next_reader: AtomicU64,
    dropped_packets: AtomicU64,
}

impl StreamEntry {
    pub fn new(path: String, sdp: Vec<u8>, publisher_conn: u64) -> Self {
        let (evict_tx, evict_rx) = watch::channel(false);
        let tracks = sdp::parse_tracks(&sdp);
        Self {
            path,
            sdp,
            tracks,
            created_at: Utc::now(),
            publisher_conn,
            ready: AtomicBool::new(false),
            evict_tx,
            evict_rx,
            readers: Mutex::new(HashMap::new()),
            next_reader: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
        }
    }

    /// Mark the publisher as actively sending (RECORD received).
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Signal the owning publisher connection to disconnect (a newer
    /// publisher claimed the path, or the path is being removed).
    pub fn evict(&self) {
        let _ = self.evict_tx.send(true);
    }

    /// Receiver resolving when this stream's publisher is evicted.
    pub fn evicted(&self) -> watch::Receiver<bool> {
        self.evict_rx.clone()
    }

    /// Attach a reader; returns its id and the packet channel.
    pub fn add_reader(&self) -> (u64, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(READER_QUEUE);
        let id = self.next_reader.fetch_add(1, Ordering::SeqCst);
        self.readers.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    pub fn remove_reader(&self, id: u64) {
        self.readers.lock().unwrap().remove(&id);
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().unwrap().len()
    }

    /// Fan one interleaved frame out to every reader. Best effort: a full
    /// reader queue drops the frame for that reader only, and a closed
    /// reader is swept out.
    pub fn broadcast(&self, frame: Bytes) {
        let mut dead = Vec::new();
        {
            let readers = self.readers.lock().unwrap();
            for (id, tx) in readers.iter() {
                match tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut readers = self.readers.lock().unwrap();
            for id in dead {
                readers.remove(&id);
            }
        }
    }

    /// Drop every reader channel so attached readers observe end-of-stream.
    pub fn close_readers(&self) {
        self.readers.lock().unwrap().clear();
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }
}
