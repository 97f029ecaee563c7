//! Shared application state.

use std::sync::Arc;

use switchboard_core::{
    Coordinator, EventBroker, HlsManager, RecordingManager, RtspServer,
};

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    coordinator: Arc<Coordinator>,
    recordings: Arc<RecordingManager>,
    hls: Arc<HlsManager>,
    rtsp: Arc<RtspServer>,
    events: Arc<EventBroker>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        recordings: Arc<RecordingManager>,
        hls: Arc<HlsManager>,
        rtsp: Arc<RtspServer>,
        events: Arc<EventBroker>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                coordinator,
                recordings,
                hls,
                rtsp,
                events,
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.inner.coordinator
    }

    pub fn recordings(&self) -> &Arc<RecordingManager> {
        &self.inner.recordings
    }

    pub fn hls(&self) -> &Arc<HlsManager> {
        &self.inner.hls
    }

    pub fn rtsp(&self) -> &Arc<RtspServer> {
        &self.inner.rtsp
    }

    pub fn events(&self) -> &Arc<EventBroker> {
        &self.inner.events
    }
}
