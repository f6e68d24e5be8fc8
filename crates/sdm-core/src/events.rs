//! Download lifecycle events and their fan-out bus.
//!
//! One broadcaster per worker pool. Sends never block: a subscriber that
//! falls behind loses the oldest messages instead of stalling workers.

use serde::Serialize;
use tokio::sync::broadcast;

/// Default broadcast capacity per subscriber before lagging drops kick in.
const EVENT_CAPACITY: usize = 256;

/// Events published by the engine, serialized with the wire field names.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    #[serde(rename = "download-started")]
    Started {
        id: String,
        url: String,
        filename: String,
        total: u64,
        dest_path: String,
    },
    #[serde(rename = "download-queued")]
    Queued { id: String, filename: String },
    #[serde(rename = "download-paused")]
    Paused { id: String, downloaded: u64 },
    #[serde(rename = "download-resumed")]
    Resumed { id: String },
    #[serde(rename = "progress")]
    Progress {
        id: String,
        downloaded: u64,
        total: u64,
        speed_bps: f64,
        elapsed_ns: u64,
        active_connections: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunk_bitmap: Option<Vec<u8>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bitmap_width: Option<usize>,
    },
    #[serde(rename = "download-complete")]
    Complete {
        id: String,
        filename: String,
        /// Total elapsed across sessions, nanoseconds.
        elapsed: u64,
        total: u64,
    },
    #[serde(rename = "download-error")]
    Error {
        id: String,
        filename: String,
        err: String,
    },
    #[serde(rename = "download-removed")]
    Removed { id: String, filename: String },
}

impl DownloadEvent {
    /// Id of the download this event belongs to.
    pub fn download_id(&self) -> &str {
        match self {
            DownloadEvent::Started { id, .. }
            | DownloadEvent::Queued { id, .. }
            | DownloadEvent::Paused { id, .. }
            | DownloadEvent::Resumed { id }
            | DownloadEvent::Progress { id, .. }
            | DownloadEvent::Complete { id, .. }
            | DownloadEvent::Error { id, .. }
            | DownloadEvent::Removed { id, .. } => id,
        }
    }
}

/// Non-blocking fan-out broadcaster.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloadEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    /// Publish to all current subscribers. Dropped silently when nobody
    /// listens; per-subscriber ordering is the publish order.
    pub fn publish(&self, event: DownloadEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
