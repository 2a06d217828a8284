//! Per-request bookkeeping of the loader.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buffer::{AppendPayload, MediaType};
use crate::playlist::{ByteRange, InitSegment, KeyDescriptor, Playlist, Segment};
use crate::transmux::{TrackInfo, TransmuxedSegment};

/// Where the segment being loaded lives.
#[derive(Debug, Clone)]
pub(crate) enum SegmentRef {
    /// Index into the loader's current playlist.
    Active(usize),
    /// The segment fell off a refreshed live playlist while in flight; learned
    /// timing is recorded on this copy.
    Detached(Box<Segment>),
}

impl SegmentRef {
    pub(crate) fn resolve<'a>(&'a self, playlist: Option<&'a Playlist>) -> Option<&'a Segment> {
        match self {
            SegmentRef::Active(index) => playlist.and_then(|p| p.segments.get(*index)),
            SegmentRef::Detached(segment) => Some(segment),
        }
    }

    pub(crate) fn resolve_mut<'a>(
        &'a mut self,
        playlist: Option<&'a mut Playlist>,
    ) -> Option<&'a mut Segment> {
        match self {
            SegmentRef::Active(index) => playlist.and_then(|p| p.segments.get_mut(*index)),
            SegmentRef::Detached(segment) => Some(segment),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RequestStats {
    pub bytes_received: u64,
    pub round_trip: Duration,
    pub requested_at: Option<Instant>,
}

/// One segment (or part) moving through request, processing and append.
#[derive(Debug, Clone)]
pub(crate) struct SegmentInfo {
    pub uri: String,
    pub media_index: usize,
    pub part_index: Option<usize>,
    pub media_sequence: u64,
    pub timeline: u64,
    pub duration: f64,
    pub discontinuity_start: bool,
    pub start_of_segment: f64,
    /// Presentation time the segment should start at when the buffer offset
    /// has to change.
    pub timestamp_offset: Option<f64>,
    pub is_sync_request: bool,
    pub byte_range: Option<ByteRange>,
    pub key: Option<KeyDescriptor>,
    pub map: Option<InitSegment>,
    pub segment: SegmentRef,
    pub stats: RequestStats,
    /// Media-time span (rollover corrected) reported by the transmuxer.
    pub media_span: Option<(f64, f64)>,
    /// Learned presentation start and end.
    pub timing: Option<(f64, f64)>,
}

impl SegmentInfo {
    pub(crate) fn seconds(&self) -> f64 {
        self.timing.map_or(self.duration, |(start, end)| end - start)
    }
}

/// Output of the processing stage.
#[derive(Debug, Clone)]
pub(crate) struct Processed {
    pub transmuxed: TransmuxedSegment,
    /// Init segment id and bytes for segments with a map.
    pub init: Option<(String, Bytes)>,
    /// Track info learned by probing the init segment in this pass.
    pub probed: Option<TrackInfo>,
}

#[derive(Debug)]
pub(crate) struct PendingSegment {
    pub info: SegmentInfo,
    pub token: CancellationToken,
    /// `abort()` arrived before the append began.
    pub aborted: bool,
}

impl PendingSegment {
    pub(crate) fn new(info: SegmentInfo) -> Self {
        Self {
            info,
            token: CancellationToken::new(),
            aborted: false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum WaitStage {
    /// Held back until another loader reaches the segment's timeline.
    Parked,
    Requesting,
    Processing,
    /// Processed, waiting on the timeline registry before appending.
    Gated(Box<Processed>),
}

#[derive(Debug)]
pub(crate) enum AppendStage {
    Appending { retried: bool },
    /// Removing content behind the playhead after a quota error.
    FreeingSpace { retry: Vec<(MediaType, AppendPayload)> },
    RetryDelay { retry: Vec<(MediaType, AppendPayload)> },
}

/// Loader state together with the data that only exists in that state.
#[derive(Debug)]
pub(crate) enum Phase {
    Init,
    Ready,
    Waiting(Box<PendingSegment>, WaitStage),
    WaitingOnTimeline(Box<PendingSegment>, Box<Processed>),
    Appending(Box<PendingSegment>, AppendStage),
}

impl Phase {
    pub(crate) fn state(&self) -> super::LoaderState {
        use super::LoaderState;
        match self {
            Phase::Init => LoaderState::Init,
            Phase::Ready => LoaderState::Ready,
            Phase::Waiting(..) => LoaderState::Waiting,
            Phase::WaitingOnTimeline(..) => LoaderState::WaitingOnTimeline,
            Phase::Appending(..) => LoaderState::Appending,
        }
    }

    pub(crate) fn pending_mut(&mut self) -> Option<&mut PendingSegment> {
        match self {
            Phase::Waiting(pending, _)
            | Phase::WaitingOnTimeline(pending, _)
            | Phase::Appending(pending, _) => Some(pending),
            Phase::Init | Phase::Ready => None,
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        matches!(
            self,
            Phase::Waiting(..) | Phase::WaitingOnTimeline(..) | Phase::Appending(..)
        )
    }
}
