//! # Segment loader
//!
//! Fetches, decrypts, transmuxes and appends the segments of one playlist,
//! keeping the buffer `goal_buffer_length` seconds ahead of the playhead.
//!
//! A [`SegmentLoader`] is a handle to a task that owns all loader state.
//! Commands are queued to that task; state is published back through a
//! snapshot after every step and through [`LoaderEvent`]s.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use segloader::{LoaderConfig, LoaderDeps, LoaderKind, SegmentLoader};
//! # async fn example(deps: LoaderDeps, playlist: segloader::Playlist) {
//! let loader = SegmentLoader::new(LoaderKind::Main, LoaderConfig::default(), deps);
//! let mut events = loader.subscribe();
//! loader.playlist(playlist);
//! loader.load();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

mod pipeline;
mod segment;
pub mod selection;
mod task;
pub mod timing;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

use crate::config::LoaderConfig;
use crate::events::{EventEmitter, LoaderEvent};
use crate::playback::Playback;
use crate::playlist::Playlist;
use crate::source_updater::SourceUpdater;
use crate::sync::SyncSource;
use crate::text_track::TextTrack;
use crate::timeline::{TimelineChangeController, TimelineRole};
use crate::transmux::Transmuxer;
use crate::transport::HttpTransport;

use task::{Command, LoaderTask};

/// Which rendition a loader feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderKind {
    Main,
    Audio,
    Subtitle,
}

impl LoaderKind {
    /// Role this loader plays in the timeline registry.
    pub fn timeline_role(&self) -> Option<TimelineRole> {
        match self {
            LoaderKind::Main => Some(TimelineRole::Main),
            LoaderKind::Audio => Some(TimelineRole::Audio),
            LoaderKind::Subtitle => None,
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderKind::Main => write!(f, "main"),
            LoaderKind::Audio => write!(f, "audio"),
            LoaderKind::Subtitle => write!(f, "subtitle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LoaderState {
    #[default]
    Init,
    Ready,
    Waiting,
    Appending,
    WaitingOnTimeline,
}

/// Transfer and append counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoaderStats {
    /// Bits per second of the last segment download.
    pub bandwidth: f64,
    pub round_trip: Option<Duration>,
    /// Running mean of bits per second from request to processed.
    pub throughput: f64,
    pub throughput_samples: u64,
    pub media_bytes_transferred: u64,
    pub media_transfer_duration: Duration,
    pub media_seconds_loaded: f64,
    pub media_appends: u64,
    /// Completed requests, successful or not. Aborts are counted separately.
    pub media_requests: u64,
    pub media_requests_errored: u64,
    pub media_requests_timedout: u64,
    pub media_requests_aborted: u64,
}

/// Loader state as of the end of the task's last step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoaderSnapshot {
    pub state: LoaderState,
    pub media_index: Option<usize>,
    pub part_index: Option<usize>,
    pub current_timeline: Option<u64>,
    pub stats: LoaderStats,
}

/// Collaborators shared with the other loaders of a player.
#[derive(Clone)]
pub struct LoaderDeps {
    pub transport: Arc<dyn HttpTransport>,
    pub transmuxer: Arc<dyn Transmuxer>,
    pub sync: Arc<dyn SyncSource>,
    pub playback: Arc<dyn Playback>,
    pub source_updater: Arc<SourceUpdater>,
    pub timelines: Arc<TimelineChangeController>,
}

pub(crate) struct Shared {
    pub(crate) snapshot: RwLock<LoaderSnapshot>,
    pub(crate) paused: AtomicBool,
    pub(crate) disposed: AtomicBool,
}

/// Handle to a running loader task. Dropping the handle disposes the loader.
pub struct SegmentLoader {
    kind: LoaderKind,
    commands: mpsc::UnboundedSender<Command>,
    events: EventEmitter,
    shared: Arc<Shared>,
}

impl SegmentLoader {
    /// Spawn the loader task. Must be called from within a tokio runtime.
    pub fn new(kind: LoaderKind, config: LoaderConfig, deps: LoaderDeps) -> Self {
        let events = EventEmitter::new(config.event_channel_capacity);
        let shared = Arc::new(Shared {
            snapshot: RwLock::new(LoaderSnapshot::default()),
            paused: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let task = LoaderTask::new(
            kind,
            Arc::new(config),
            deps,
            events.clone(),
            shared.clone(),
            rx,
        );
        tokio::spawn(task.run());
        Self {
            kind,
            commands: tx,
            events,
            shared,
        }
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(loader = %self.kind, "Command sent to a stopped loader");
        }
    }

    /// Assign a new or refreshed playlist.
    pub fn playlist(&self, playlist: Playlist) {
        self.send(Command::Playlist(Box::new(playlist)));
    }

    /// Start or resume loading. Calling it while already loading has no effect.
    pub fn load(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.send(Command::Load);
    }

    /// Stop scheduling new requests; in-flight work completes.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.send(Command::Pause);
    }

    pub fn paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Abandon the current request. Appends already underway complete.
    pub fn abort(&self) {
        self.send(Command::Abort);
    }

    pub fn dispose(&self) {
        self.send(Command::Dispose);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Remove `[start, end)` from every buffer this loader writes to.
    pub async fn remove(&self, start: f64, end: f64) {
        let (done, rx) = oneshot::channel();
        self.send(Command::Remove { start, end, done });
        let _ = rx.await;
    }

    /// Enable or disable audio handling. A main loader with audio disabled
    /// leaves the audio buffer to an alternate audio loader.
    pub fn set_audio(&self, enabled: bool) {
        self.send(Command::SetAudio(enabled));
    }

    pub fn set_text_track(&self, track: Arc<dyn TextTrack>) {
        self.send(Command::SetTextTrack(track));
    }

    pub fn set_main_independent_segments(&self, independent: bool) {
        self.send(Command::SetMainIndependentSegments(independent));
    }

    pub fn snapshot(&self) -> LoaderSnapshot {
        self.shared.snapshot.read().clone()
    }

    pub fn state(&self) -> LoaderState {
        self.shared.snapshot.read().state
    }

    pub fn media_index(&self) -> Option<usize> {
        self.shared.snapshot.read().media_index
    }

    pub fn part_index(&self) -> Option<usize> {
        self.shared.snapshot.read().part_index
    }

    pub fn stats(&self) -> LoaderStats {
        self.shared.snapshot.read().stats.clone()
    }
}

impl Drop for SegmentLoader {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Dispose);
    }
}
