//! # Playlist Model
//!
//! Parsed media playlists as handed over by a playlist parser. Learned timing
//! (`start`/`end`) is written back onto segments and parts by the loader that
//! owns the playlist.

use serde::{Deserialize, Serialize};

use crate::ranges::TIME_FUDGE_FACTOR;
use crate::transmux::TrackInfo;

/// Byte range of a resource: `length` bytes starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Value for an HTTP `Range` header. Ranges are inclusive on both ends.
    pub fn header_value(&self) -> String {
        let end = (self.offset + self.length).saturating_sub(1);
        format!("bytes={}-{}", self.offset, end)
    }
}

/// AES-128 encryption descriptor of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub uri: String,
    /// Hex encoded IV, with or without `0x` prefix.
    #[serde(default)]
    pub iv: Option<String>,
}

/// Initialization segment descriptor (`EXT-X-MAP`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitSegment {
    pub uri: String,
    #[serde(default)]
    pub byte_range: Option<ByteRange>,
    /// Track information learned by probing the init segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_info: Option<TrackInfo>,
}

impl InitSegment {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            byte_range: None,
            track_info: None,
        }
    }

    /// Cache identity: two maps with the same uri and range are the same bytes.
    pub fn id(&self) -> String {
        match &self.byte_range {
            Some(range) => format!("{}#{}-{}", self.uri, range.offset, range.length),
            None => self.uri.clone(),
        }
    }
}

/// Low-latency partial segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub uri: String,
    pub duration: f64,
    #[serde(default)]
    pub independent: bool,
    #[serde(default)]
    pub byte_range: Option<ByteRange>,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub uri: String,
    pub duration: f64,
    /// Discontinuity id; non-decreasing along a playlist.
    #[serde(default)]
    pub timeline: u64,
    #[serde(default)]
    pub discontinuity: bool,
    #[serde(default)]
    pub byte_range: Option<ByteRange>,
    #[serde(default)]
    pub map: Option<InitSegment>,
    #[serde(default)]
    pub key: Option<KeyDescriptor>,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
}

impl Segment {
    pub fn new(uri: impl Into<String>, duration: f64) -> Self {
        Self {
            uri: uri.into(),
            duration,
            timeline: 0,
            discontinuity: false,
            byte_range: None,
            map: None,
            key: None,
            parts: Vec::new(),
            start: None,
            end: None,
        }
    }

    pub fn has_parts(&self) -> bool {
        !self.parts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub uri: String,
    #[serde(default)]
    pub media_sequence: u64,
    #[serde(default)]
    pub discontinuity_sequence: u64,
    pub target_duration: f64,
    #[serde(default)]
    pub part_target_duration: Option<f64>,
    #[serde(default)]
    pub end_list: bool,
    #[serde(default)]
    pub independent_segments: bool,
    /// Indices of segments that start a new timeline.
    #[serde(default)]
    pub discontinuity_starts: Vec<usize>,
    pub segments: Vec<Segment>,
}

impl Playlist {
    pub fn new(uri: impl Into<String>, target_duration: f64, segments: Vec<Segment>) -> Self {
        let mut playlist = Self {
            uri: uri.into(),
            media_sequence: 0,
            discontinuity_sequence: 0,
            target_duration,
            part_target_duration: None,
            end_list: false,
            independent_segments: false,
            discontinuity_starts: Vec::new(),
            segments,
        };
        playlist.discontinuity_starts = playlist.compute_discontinuity_starts();
        playlist
    }

    /// Indices at which the `timeline` value increases.
    pub fn compute_discontinuity_starts(&self) -> Vec<usize> {
        self.segments
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[1].timeline != pair[0].timeline)
            .map(|(i, _)| i + 1)
            .collect()
    }

    /// Live playlists advertising a part target duration.
    pub fn is_low_latency(&self) -> bool {
        !self.end_list && self.part_target_duration.is_some()
    }

    pub fn supports_parts(&self) -> bool {
        self.segments.iter().any(Segment::has_parts)
    }

    /// Total duration for ended playlists, infinite for live ones.
    pub fn duration(&self) -> f64 {
        if self.end_list {
            self.segments.iter().map(|s| s.duration).sum()
        } else {
            f64::INFINITY
        }
    }

    pub fn media_sequence_of(&self, index: usize) -> u64 {
        self.media_sequence + index as u64
    }

    /// Segments and parts flattened in playback order. A segment with parts is
    /// represented by its parts only.
    pub fn parts_and_segments(&self) -> Vec<PartOrSegment> {
        let mut entries = Vec::new();
        for (segment_index, segment) in self.segments.iter().enumerate() {
            if segment.has_parts() {
                for (part_index, part) in segment.parts.iter().enumerate() {
                    entries.push(PartOrSegment {
                        duration: part.duration,
                        segment_index,
                        part_index: Some(part_index),
                    });
                }
            } else {
                entries.push(PartOrSegment {
                    duration: segment.duration,
                    segment_index,
                    part_index: None,
                });
            }
        }
        entries
    }

    /// Start estimate for a segment: its learned start, or the nearest earlier
    /// learned end plus advertised durations, or the sum of advertised durations.
    pub fn estimated_start(&self, index: usize) -> f64 {
        if let Some(start) = self.segments.get(index).and_then(|s| s.start) {
            return start;
        }
        let mut time = 0.0;
        for i in (0..index.min(self.segments.len())).rev() {
            let segment = &self.segments[i];
            if let Some(end) = segment.end {
                return end + time;
            }
            time += segment.duration;
        }
        time
    }
}

/// One entry of [`Playlist::parts_and_segments`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartOrSegment {
    pub duration: f64,
    pub segment_index: usize,
    pub part_index: Option<usize>,
}

/// Result of mapping a playback time onto a playlist position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfoForTime {
    pub segment_index: usize,
    pub part_index: Option<usize>,
    /// Estimated start time of the returned segment or part.
    pub start_time: f64,
}

fn sum_durations(entries: &[PartOrSegment], from: usize, to: usize) -> f64 {
    let (lo, hi) = if from > to { (to, from) } else { (from, to) };
    entries[lo..hi].iter().map(|e| e.duration).sum()
}

/// Find the segment (and part) containing `current_time`, walking from a known
/// anchor: the entry at `starting_segment_index`/`starting_part_index` begins at
/// `start_time`.
///
/// A time within [`TIME_FUDGE_FACTOR`] of an entry's end resolves to the next
/// entry unless it is the last one.
pub fn media_info_for_time(
    playlist: &Playlist,
    current_time: f64,
    starting_segment_index: usize,
    starting_part_index: Option<usize>,
    start_time: f64,
) -> MediaInfoForTime {
    let entries = playlist.parts_and_segments();
    let Some(last) = entries.last().copied() else {
        return MediaInfoForTime {
            segment_index: 0,
            part_index: None,
            start_time: current_time,
        };
    };

    let start_index = entries
        .iter()
        .position(|e| {
            e.segment_index == starting_segment_index
                && match (starting_part_index, e.part_index) {
                    (Some(wanted), Some(part)) => wanted == part,
                    _ => true,
                }
        })
        .unwrap_or(0);

    let mut time = current_time - start_time;

    if time < 0.0 {
        for i in (0..start_index).rev() {
            let entry = entries[i];
            time += entry.duration;
            if time + TIME_FUDGE_FACTOR <= 0.0 {
                continue;
            }
            return MediaInfoForTime {
                segment_index: entry.segment_index,
                part_index: entry.part_index,
                start_time: start_time - sum_durations(&entries, start_index, i),
            };
        }
        let first = entries[0];
        return MediaInfoForTime {
            segment_index: first.segment_index,
            part_index: first.part_index,
            start_time: current_time,
        };
    }

    for i in start_index..entries.len() {
        let entry = entries[i];
        time -= entry.duration;

        let can_use_fudge = entry.duration > TIME_FUDGE_FACTOR;
        let at_end = time == 0.0;
        let close_to_end = can_use_fudge && time + TIME_FUDGE_FACTOR >= 0.0;
        if (at_end || close_to_end) && i != entries.len() - 1 {
            continue;
        }
        if time - TIME_FUDGE_FACTOR >= 0.0 {
            continue;
        }
        return MediaInfoForTime {
            segment_index: entry.segment_index,
            part_index: entry.part_index,
            start_time: start_time + sum_durations(&entries, start_index, i),
        };
    }

    MediaInfoForTime {
        segment_index: last.segment_index,
        part_index: last.part_index,
        start_time: current_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vod(count: usize, duration: f64) -> Playlist {
        let segments = (0..count)
            .map(|i| Segment::new(format!("seg{i}.ts"), duration))
            .collect();
        let mut playlist = Playlist::new("media.m3u8", duration, segments);
        playlist.end_list = true;
        playlist
    }

    #[test]
    fn test_byte_range_header_is_inclusive() {
        assert_eq!(ByteRange::new(100, 50).header_value(), "bytes=100-149");
    }

    #[test]
    fn test_media_info_for_time_walks_forward() {
        let playlist = vod(5, 10.0);
        let info = media_info_for_time(&playlist, 15.0, 0, None, 0.0);
        assert_eq!(info.segment_index, 1);
        assert_eq!(info.start_time, 10.0);
    }

    #[test]
    fn test_time_just_before_segment_end_resolves_to_next_segment() {
        let playlist = vod(5, 10.0);
        let info = media_info_for_time(&playlist, 19.999, 0, None, 0.0);
        assert_eq!(info.segment_index, 2);
        assert_eq!(info.start_time, 20.0);
    }

    #[test]
    fn test_time_at_end_of_last_segment_stays_on_last() {
        let playlist = vod(3, 10.0);
        let info = media_info_for_time(&playlist, 29.99, 0, None, 0.0);
        assert_eq!(info.segment_index, 2);
        let beyond = media_info_for_time(&playlist, 100.0, 0, None, 0.0);
        assert_eq!(beyond.segment_index, 2);
        assert_eq!(beyond.start_time, 100.0);
    }

    #[test]
    fn test_media_info_for_time_walks_backward_from_anchor() {
        let playlist = vod(5, 10.0);
        let info = media_info_for_time(&playlist, 12.0, 3, None, 30.0);
        assert_eq!(info.segment_index, 1);
        assert_eq!(info.start_time, 10.0);

        let before_start = media_info_for_time(&playlist, -50.0, 3, None, 30.0);
        assert_eq!(before_start.segment_index, 0);
    }

    #[test]
    fn test_media_info_for_time_with_parts() {
        let mut playlist = vod(2, 4.0);
        playlist.segments[1].parts = (0..4)
            .map(|i| Part {
                uri: format!("part{i}.mp4"),
                duration: 1.0,
                independent: i % 2 == 0,
                byte_range: None,
                start: None,
                end: None,
            })
            .collect();
        let info = media_info_for_time(&playlist, 6.5, 0, None, 0.0);
        assert_eq!(info.segment_index, 1);
        assert_eq!(info.part_index, Some(2));
        assert_eq!(info.start_time, 6.0);
    }

    #[test]
    fn test_discontinuity_starts_and_estimated_start() {
        let mut segments: Vec<Segment> = (0..4).map(|i| Segment::new(format!("{i}.ts"), 6.0)).collect();
        segments[2].timeline = 1;
        segments[3].timeline = 1;
        segments[1].end = Some(100.0);
        let playlist = Playlist::new("live.m3u8", 6.0, segments);
        assert_eq!(playlist.discontinuity_starts, vec![2]);
        assert_eq!(playlist.estimated_start(3), 106.0);
        assert_eq!(playlist.estimated_start(1), 6.0);
        assert!(playlist.duration().is_infinite());
    }

    #[test]
    fn test_playlist_deserializes_from_json() {
        let json = r#"{
            "uri": "https://example.com/v.m3u8",
            "target_duration": 6.0,
            "end_list": true,
            "segments": [
                {"uri": "a.ts", "duration": 6.0, "key": {"uri": "k.bin"}},
                {"uri": "b.ts", "duration": 5.5, "byte_range": {"offset": 0, "length": 1024}}
            ]
        }"#;
        let playlist: Playlist = serde_json::from_str(json).unwrap();
        assert_eq!(playlist.segments.len(), 2);
        assert_eq!(playlist.segments[0].key.as_ref().map(|k| k.uri.as_str()), Some("k.bin"));
        assert_eq!(playlist.duration(), 11.5);
    }
}
