use std::time::Duration;

use aulos_core::DownloadIdGen;
use tokio::sync::broadcast;

use crate::sink::SegmentState;

/// Observability events published by the workers.
///
/// Receivers that lag simply lose events; nothing in the pipeline depends on
/// their delivery.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MetadataReady {
        track_count: usize,
        duration: Duration,
    },
    DownloadProgress {
        download_id: u64,
        offset: u64,
    },
    SegmentDone {
        download_id: u64,
        state: SegmentState,
        bytes: u64,
        status: Option<u16>,
    },
    TrackEnded {
        track_id: u32,
    },
    Error {
        detail: String,
    },
}

/// Top-level context shared by the workers of one open asset: the download
/// id source and the event bus. Nothing here is process-global.
#[derive(Debug, Clone)]
pub struct StreamContext {
    ids: DownloadIdGen,
    events: broadcast::Sender<StreamEvent>,
}

impl StreamContext {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            ids: DownloadIdGen::new(),
            events,
        }
    }

    pub fn ids(&self) -> &DownloadIdGen {
        &self.ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new(64)
    }
}
