//! # Sync points
//!
//! Relates playlist positions to presentation time. Loaders ask for a sync
//! point when they have no tracked index and report the timing they learn
//! from every processed segment.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::playlist::Playlist;

/// A known-good `(time, segment index)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPoint {
    pub time: f64,
    pub segment_index: usize,
    pub part_index: Option<usize>,
}

/// Learned timing of one processed segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTiming {
    pub playlist_uri: String,
    pub media_sequence: u64,
    pub timeline: u64,
    /// Start in media time (rollover corrected, seconds).
    pub media_start: f64,
    /// Start and end in presentation time.
    pub start: f64,
    pub end: f64,
    pub discontinuity_start: bool,
}

pub trait SyncSource: Send + Sync {
    fn sync_point(
        &self,
        playlist: &Playlist,
        duration: f64,
        current_timeline: Option<u64>,
        current_time: f64,
    ) -> Option<SyncPoint>;

    /// Offset from media time to presentation time for a timeline.
    fn mapping_for_timeline(&self, timeline: u64) -> Option<f64>;

    fn save_segment_timing(&self, timing: &SegmentTiming);

    /// Remember the timing of segments that dropped off a refreshed live playlist.
    fn save_expired_segment_info(&self, old: &Playlist, new: &Playlist);
}

#[derive(Debug, Clone, Copy)]
struct ExpiredInfo {
    media_sequence: u64,
    time: f64,
}

#[derive(Debug, Clone, Copy)]
struct DiscontinuityInfo {
    media_sequence: u64,
    time: f64,
}

#[derive(Default)]
struct SyncState {
    timelines: HashMap<u64, f64>,
    expired: HashMap<String, ExpiredInfo>,
    discontinuities: HashMap<u64, DiscontinuityInfo>,
}

/// Default [`SyncSource`] combining VOD, known-segment, discontinuity and
/// expired-segment strategies; the candidate closest to the playhead wins.
#[derive(Default)]
pub struct SyncController {
    state: RwLock<SyncState>,
}

impl SyncController {
    pub fn new() -> Self {
        Self::default()
    }

    fn vod_strategy(playlist: &Playlist, duration: f64) -> Option<SyncPoint> {
        (duration.is_finite() || playlist.end_list).then_some(SyncPoint {
            time: 0.0,
            segment_index: 0,
            part_index: None,
        })
    }

    fn segment_strategy(
        playlist: &Playlist,
        current_timeline: Option<u64>,
        current_time: f64,
    ) -> Option<SyncPoint> {
        let timeline = current_timeline?;
        let mut best: Option<(f64, SyncPoint)> = None;
        for (segment_index, segment) in playlist.segments.iter().enumerate() {
            if segment.timeline != timeline {
                continue;
            }
            let mut candidates = vec![(segment.start, None)];
            candidates.extend(
                segment
                    .parts
                    .iter()
                    .enumerate()
                    .map(|(i, part)| (part.start, Some(i))),
            );
            for (start, part_index) in candidates {
                let Some(start) = start else { continue };
                let distance = (current_time - start).abs();
                if best.as_ref().is_none_or(|(d, _)| distance < *d) {
                    best = Some((
                        distance,
                        SyncPoint {
                            time: start,
                            segment_index,
                            part_index,
                        },
                    ));
                }
            }
        }
        best.map(|(_, point)| point)
    }

    fn discontinuity_strategy(&self, playlist: &Playlist, current_time: f64) -> Option<SyncPoint> {
        let state = self.state.read();
        playlist
            .discontinuity_starts
            .iter()
            .filter_map(|&index| {
                let segment = playlist.segments.get(index)?;
                let info = state.discontinuities.get(&segment.timeline)?;
                (info.media_sequence == playlist.media_sequence_of(index)).then_some(SyncPoint {
                    time: info.time,
                    segment_index: index,
                    part_index: None,
                })
            })
            .min_by(|a, b| {
                (current_time - a.time)
                    .abs()
                    .total_cmp(&(current_time - b.time).abs())
            })
    }

    fn expired_strategy(&self, playlist: &Playlist) -> Option<SyncPoint> {
        let info = *self.state.read().expired.get(&playlist.uri)?;
        if info.media_sequence > playlist.media_sequence {
            return None;
        }
        // The anchor segment is gone; estimate the first remaining one.
        let missing = playlist.media_sequence - info.media_sequence;
        Some(SyncPoint {
            time: info.time + missing as f64 * playlist.target_duration,
            segment_index: 0,
            part_index: None,
        })
    }
}

impl SyncSource for SyncController {
    fn sync_point(
        &self,
        playlist: &Playlist,
        duration: f64,
        current_timeline: Option<u64>,
        current_time: f64,
    ) -> Option<SyncPoint> {
        let candidates = [
            Self::vod_strategy(playlist, duration),
            Self::segment_strategy(playlist, current_timeline, current_time),
            self.discontinuity_strategy(playlist, current_time),
            self.expired_strategy(playlist),
        ];
        let chosen = candidates
            .into_iter()
            .flatten()
            .filter(|point| point.segment_index < playlist.segments.len())
            .min_by(|a, b| {
                (current_time - a.time)
                    .abs()
                    .total_cmp(&(current_time - b.time).abs())
            });
        trace!(uri = %playlist.uri, ?chosen, "Sync point lookup");
        chosen
    }

    fn mapping_for_timeline(&self, timeline: u64) -> Option<f64> {
        self.state.read().timelines.get(&timeline).copied()
    }

    fn save_segment_timing(&self, timing: &SegmentTiming) {
        let mut state = self.state.write();
        let mapping = timing.start - timing.media_start;
        if state.timelines.insert(timing.timeline, mapping).is_none() {
            debug!(timeline = timing.timeline, mapping, "New timeline mapping");
        }
        if timing.discontinuity_start {
            state.discontinuities.insert(
                timing.timeline,
                DiscontinuityInfo {
                    media_sequence: timing.media_sequence,
                    time: timing.start,
                },
            );
        }
    }

    fn save_expired_segment_info(&self, old: &Playlist, new: &Playlist) {
        if new.media_sequence <= old.media_sequence {
            return;
        }
        let diff = (new.media_sequence - old.media_sequence) as usize;
        let expired = old.segments[..diff.min(old.segments.len())]
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, segment)| {
                segment.start.map(|time| ExpiredInfo {
                    media_sequence: old.media_sequence_of(i),
                    time,
                })
            });
        if let Some(info) = expired {
            debug!(uri = %new.uri, media_sequence = info.media_sequence, time = info.time, "Saved expired segment info");
            self.state.write().expired.insert(new.uri.clone(), info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::Segment;

    fn live(count: usize, media_sequence: u64) -> Playlist {
        let segments = (0..count).map(|i| Segment::new(format!("{i}.ts"), 6.0)).collect();
        let mut playlist = Playlist::new("live.m3u8", 6.0, segments);
        playlist.media_sequence = media_sequence;
        playlist
    }

    #[test]
    fn test_vod_playlist_syncs_at_zero() {
        let controller = SyncController::new();
        let mut playlist = live(3, 0);
        playlist.end_list = true;
        let point = controller
            .sync_point(&playlist, playlist.duration(), None, 0.0)
            .unwrap();
        assert_eq!((point.time, point.segment_index), (0.0, 0));
    }

    #[test]
    fn test_live_without_timing_has_no_sync_point() {
        let controller = SyncController::new();
        let playlist = live(3, 10);
        assert!(controller.sync_point(&playlist, f64::INFINITY, Some(0), 5.0).is_none());
    }

    #[test]
    fn test_known_segment_closest_to_playhead() {
        let controller = SyncController::new();
        let mut playlist = live(4, 0);
        playlist.segments[0].start = Some(0.0);
        playlist.segments[2].start = Some(12.0);
        let point = controller
            .sync_point(&playlist, f64::INFINITY, Some(0), 11.0)
            .unwrap();
        assert_eq!(point.segment_index, 2);
        // Different timeline: not usable.
        assert!(controller.sync_point(&playlist, f64::INFINITY, Some(1), 11.0).is_none());
    }

    #[test]
    fn test_expired_segments_keep_timing() {
        let controller = SyncController::new();
        let mut old = live(4, 100);
        old.segments[1].start = Some(6.0);
        let new = live(4, 103);
        controller.save_expired_segment_info(&old, &new);
        let point = controller.sync_point(&new, f64::INFINITY, Some(0), 0.0).unwrap();
        assert_eq!(point.segment_index, 0);
        assert_eq!(point.time, 6.0 + 2.0 * 6.0);
    }

    #[test]
    fn test_timeline_mapping_and_discontinuity() {
        let controller = SyncController::new();
        controller.save_segment_timing(&SegmentTiming {
            playlist_uri: "live.m3u8".into(),
            media_sequence: 12,
            timeline: 3,
            media_start: 1000.0,
            start: 40.0,
            end: 46.0,
            discontinuity_start: true,
        });
        assert_eq!(controller.mapping_for_timeline(3), Some(-960.0));
        assert_eq!(controller.mapping_for_timeline(4), None);

        let mut playlist = live(4, 10);
        for segment in &mut playlist.segments[2..] {
            segment.timeline = 3;
        }
        playlist.discontinuity_starts = playlist.compute_discontinuity_starts();
        let point = controller.sync_point(&playlist, f64::INFINITY, None, 40.0).unwrap();
        assert_eq!((point.time, point.segment_index), (40.0, 2));
    }
}
