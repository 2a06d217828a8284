use std::time::Duration;

use tokio::sync::broadcast;

use crate::buffer::MediaType;
use crate::error::LoaderError;
use crate::text_track::Cue;
use crate::transmux::TimedMetadata;

/// Notifications published by a segment loader.
#[derive(Debug, Clone)]
pub enum LoaderEvent {
    /// Download progress of the current segment request.
    Progress {
        uri: String,
        bytes_received: u64,
    },
    /// A segment is about to be handed to the buffer queue.
    Appending {
        media_index: usize,
        part_index: Option<usize>,
    },
    /// A segment finished appending. Fires once per successful append.
    Appended {
        media_index: usize,
        part_index: Option<usize>,
        bytes: usize,
    },
    /// Follows `Appended` unless the loader was aborted before the append began.
    AppendsDone,
    AppendError(LoaderError),
    Error(LoaderError),
    BandwidthUpdate {
        bandwidth: f64,
        round_trip: Option<Duration>,
    },
    TimestampOffset {
        media_type: MediaType,
        offset: f64,
    },
    SyncInfoUpdate,
    PlaylistUpdate,
    Ended,
    Captions(Vec<Cue>),
    Metadata(Vec<TimedMetadata>),
}

/// Fan-out of loader events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<LoaderEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.tx.subscribe()
    }

    /// Sends are fire-and-forget; having no subscriber is fine.
    pub fn emit(&self, event: LoaderEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(128)
    }
}
