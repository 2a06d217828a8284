//! Timestamp and timeline rules applied while processing segments.

use crate::loader::LoaderKind;
use crate::ranges::TimeRanges;
use crate::timeline::{TimelineChangeController, TimelineRole};
use crate::transmux::{ONE_SECOND_IN_TS, TrackInfo};

/// Period of the 33-bit MPEG-TS clock.
pub const MAX_TS: i64 = 1 << 33;

/// Half a period; larger jumps are treated as a wrap.
pub const RO_THRESH: i64 = 1 << 32;

/// Move `value` by whole clock periods until it lies within half a period of
/// `reference`.
pub fn handle_rollover(value: i64, reference: i64) -> i64 {
    let direction = if reference < value { -MAX_TS } else { MAX_TS };
    let mut value = value;
    while (reference - value).abs() > RO_THRESH {
        value += direction;
    }
    value
}

/// Keeps consecutive segments of a timeline continuous across clock wraps.
#[derive(Debug, Clone, Default)]
pub struct RolloverTracker {
    reference: Option<(u64, i64)>,
}

impl RolloverTracker {
    /// Rollover-corrected `(start, end)` in seconds for raw 90 kHz ticks. The
    /// start is corrected against the previous segment's end on the same
    /// timeline and the end against the corrected start.
    pub fn adjust(&mut self, timeline: u64, start: u64, end: u64) -> (f64, f64) {
        let reference = match self.reference {
            Some((t, reference)) if t == timeline => reference,
            _ => start as i64,
        };
        let start = handle_rollover(start as i64, reference);
        let end = handle_rollover(end as i64, start);
        self.reference = Some((timeline, end));
        (ticks_to_seconds(start), ticks_to_seconds(end))
    }

    pub fn reset(&mut self) {
        self.reference = None;
    }
}

pub fn ticks_to_seconds(ticks: i64) -> f64 {
    ticks as f64 / ONE_SECOND_IN_TS as f64
}

/// The presentation start a buffer offset should map a segment to, or `None`
/// when the buffer offset must stay as it is.
///
/// Only a change of timeline (or a forced check after a resync) computes an
/// offset. Moving back to an older timeline uses the segment's own start;
/// otherwise new content is placed right after what is buffered.
pub fn timestamp_offset_for_segment(
    segment_timeline: u64,
    current_timeline: Option<u64>,
    start_of_segment: f64,
    buffered: &TimeRanges,
    override_check: bool,
) -> Option<f64> {
    if !override_check && current_timeline == Some(segment_timeline) {
        return None;
    }
    if current_timeline.is_some_and(|current| segment_timeline < current) {
        return Some(start_of_segment);
    }
    Some(buffered.last_end().unwrap_or(start_of_segment))
}

/// Whether a segment on `segment_timeline` has to wait for another loader to
/// reach that timeline first.
pub fn should_wait_for_timeline_change(
    kind: LoaderKind,
    current_timeline: Option<u64>,
    segment_timeline: u64,
    timelines: &TimelineChangeController,
    audio_disabled: bool,
) -> bool {
    if current_timeline == Some(segment_timeline) {
        return false;
    }
    match kind {
        LoaderKind::Audio | LoaderKind::Subtitle => {
            !timelines.reaches(TimelineRole::Main, segment_timeline)
        }
        LoaderKind::Main if audio_disabled => {
            !timelines.reaches(TimelineRole::Audio, segment_timeline)
        }
        LoaderKind::Main => false,
    }
}

/// Describes why switching from `starting` to `current` tracks is not
/// allowed, if it is not.
pub fn illegal_media_switch(
    kind: LoaderKind,
    starting: Option<&TrackInfo>,
    current: &TrackInfo,
) -> Option<String> {
    if kind != LoaderKind::Main {
        return None;
    }
    let starting = starting?;
    if !current.has_audio && !current.has_video {
        return Some("Neither audio nor video found in segment".to_string());
    }
    if starting.has_video && !current.has_video {
        return Some(
            "Only audio found in segment where video was expected; cannot switch to audio only from a stream with video"
                .to_string(),
        );
    }
    if !starting.has_video && current.has_video {
        return Some(
            "Video found in segment where only audio was expected; cannot switch to video from an audio only stream"
                .to_string(),
        );
    }
    if starting.has_audio != current.has_audio {
        return Some(format!(
            "Track layout changed mid-stream (audio: {} -> {}, video: {} -> {}); cannot switch between muxed and single track content",
            starting.has_audio, current.has_audio, starting.has_video, current.has_video
        ));
    }
    None
}

/// End of the window that may be trimmed behind the playhead: at most
/// `back_buffer_length` behind it, never past the seekable start, and never
/// within one target duration of the playhead.
pub fn safe_back_buffer_trim_time(
    seekable: &TimeRanges,
    current_time: f64,
    target_duration: f64,
    back_buffer_length: f64,
) -> f64 {
    let mut trim_time = current_time - back_buffer_length;
    if let Some(seekable_start) = seekable.first_start() {
        trim_time = trim_time.max(seekable_start);
    }
    trim_time.min(current_time - target_duration)
}
