//! Choosing the next segment or part to request.

use crate::playlist::{Playlist, Segment, media_info_for_time};
use crate::ranges::{TIME_FUDGE_FACTOR, TimeRanges};
use crate::sync::SyncPoint;

/// Everything the selection needs to know about the loader and the player.
#[derive(Debug, Clone)]
pub struct SelectionContext<'a> {
    pub playlist: &'a Playlist,
    pub buffered: &'a TimeRanges,
    pub current_time: f64,
    pub has_played: bool,
    pub seeking: bool,
    pub media_source_ended: bool,
    pub goal_buffer_length: f64,
    pub media_index: Option<usize>,
    pub part_index: Option<usize>,
    pub sync_point: Option<SyncPoint>,
    pub current_timeline: Option<u64>,
    pub fetch_at_buffer: bool,
    /// `EXT-X-INDEPENDENT-SEGMENTS` declared by the multivariant playlist.
    pub main_independent_segments: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NextRequest {
    pub media_index: usize,
    pub part_index: Option<usize>,
    /// Where the segment is expected to start in presentation time.
    pub start_of_segment: f64,
    /// No sync point was known: the request probes the playlist's timing.
    pub is_sync_request: bool,
    /// Time the request was chosen for.
    pub target_time: f64,
}

/// First segment on `timeline` whose cumulative duration passes
/// `target_time`, or the last segment on that timeline.
pub fn sync_segment_candidate(
    timeline: Option<u64>,
    segments: &[Segment],
    target_time: f64,
) -> usize {
    let mut last_on_timeline = None;
    let mut time = 0.0;
    for (i, segment) in segments.iter().enumerate() {
        if Some(segment.timeline) != timeline {
            continue;
        }
        last_on_timeline = Some(i);
        time += segment.duration;
        if time > target_time {
            return i;
        }
    }
    last_on_timeline.unwrap_or(0)
}

/// Duration of one fetch unit: the tracked segment or part, otherwise the
/// shortest entry of the playlist.
fn fetch_unit_duration(ctx: &SelectionContext<'_>) -> Option<f64> {
    let tracked = ctx.media_index.and_then(|index| ctx.playlist.segments.get(index));
    match tracked {
        Some(segment) => Some(
            ctx.part_index
                .and_then(|part| segment.parts.get(part))
                .map_or(segment.duration, |part| part.duration),
        ),
        None => ctx
            .playlist
            .parts_and_segments()
            .iter()
            .map(|entry| entry.duration)
            .min_by(f64::total_cmp),
    }
}

pub fn choose_next_request(ctx: &SelectionContext<'_>) -> Option<NextRequest> {
    let segments = &ctx.playlist.segments;
    if segments.is_empty() {
        return None;
    }

    let buffered_end = ctx.buffered.last_end().unwrap_or(0.0);
    let buffered_time = ctx.buffered.time_ahead_of(ctx.current_time);
    // Before playback starts one segment (or part) ahead is enough.
    let preloaded = !ctx.has_played
        && buffered_time > 0.0
        && fetch_unit_duration(ctx).is_some_and(|unit| buffered_time + TIME_FUDGE_FACTOR >= unit);
    let have_enough_buffer = buffered_time >= ctx.goal_buffer_length;
    if preloaded || have_enough_buffer {
        return None;
    }

    let is_sync_request = ctx.sync_point.is_none();
    let (media_index, mut part_index, start_of_segment, target_time) = if let Some(sync_point) =
        ctx.sync_point
    {
        match ctx.media_index {
            Some(index) => {
                let segment = segments.get(index)?;
                let start = segment.end.unwrap_or(buffered_end);
                let next_part = ctx.part_index.map_or(0, |p| p + 1);
                if next_part < segment.parts.len() {
                    (index, Some(next_part), start, buffered_end)
                } else {
                    (index + 1, None, start, buffered_end)
                }
            }
            None => {
                let target = if ctx.fetch_at_buffer {
                    buffered_end
                } else {
                    ctx.current_time
                };
                let info = media_info_for_time(
                    ctx.playlist,
                    target,
                    sync_point.segment_index,
                    sync_point.part_index,
                    sync_point.time,
                );
                (info.segment_index, info.part_index, info.start_time, target)
            }
        }
    } else {
        let index = sync_segment_candidate(ctx.current_timeline, segments, buffered_end);
        (index, None, ctx.playlist.estimated_start(index), buffered_end)
    };

    let mut media_index = media_index;
    let segment = segments.get(media_index)?;
    if let Some(part) = part_index
        && part >= segment.parts.len()
    {
        return None;
    }
    if part_index.is_none() && segment.has_parts() {
        part_index = Some(0);
    }

    // Start on an independently decodable part when nothing is buffered yet.
    let independent_override = ctx.main_independent_segments || ctx.playlist.independent_segments;
    if let Some(part) = part_index
        && buffered_time == 0.0
        && !independent_override
        && !segment.parts[part].independent
    {
        if part == 0 {
            if let Some(previous) = media_index.checked_sub(1).and_then(|i| segments.get(i))
                && previous.parts.last().is_some_and(|p| p.independent)
            {
                media_index -= 1;
                part_index = Some(previous.parts.len() - 1);
            }
        } else if segment.parts[part - 1].independent {
            part_index = Some(part - 1);
        }
    }

    if media_index + 1 >= segments.len() && ctx.media_source_ended && !ctx.seeking {
        return None;
    }

    Some(NextRequest {
        media_index,
        part_index,
        start_of_segment,
        is_sync_request,
        target_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::Part;

    fn vod(count: usize) -> Playlist {
        let segments = (0..count)
            .map(|i| Segment::new(format!("seg{i}.ts"), 10.0))
            .collect();
        let mut playlist = Playlist::new("vod.m3u8", 10.0, segments);
        playlist.end_list = true;
        playlist
    }

    fn ctx<'a>(playlist: &'a Playlist, buffered: &'a TimeRanges) -> SelectionContext<'a> {
        SelectionContext {
            playlist,
            buffered,
            current_time: 0.0,
            has_played: true,
            seeking: false,
            media_source_ended: false,
            goal_buffer_length: 30.0,
            media_index: None,
            part_index: None,
            sync_point: Some(SyncPoint {
                time: 0.0,
                segment_index: 0,
                part_index: None,
            }),
            current_timeline: Some(0),
            fetch_at_buffer: false,
            main_independent_segments: false,
        }
    }

    fn parts(independent: &[bool]) -> Vec<Part> {
        independent
            .iter()
            .enumerate()
            .map(|(i, &independent)| Part {
                uri: format!("p{i}.mp4"),
                duration: 1.0,
                independent,
                byte_range: None,
                start: None,
                end: None,
            })
            .collect()
    }

    #[test]
    fn test_enough_buffer_requests_nothing() {
        let playlist = vod(10);
        let buffered = TimeRanges::single(0.0, 31.0);
        assert_eq!(choose_next_request(&ctx(&playlist, &buffered)), None);
    }

    #[test]
    fn test_buffered_just_short_of_boundary_targets_next_segment() {
        let playlist = vod(10);
        let buffered = TimeRanges::single(0.0, 19.999);
        let mut context = ctx(&playlist, &buffered);
        context.current_time = 15.0;
        context.fetch_at_buffer = true;
        let next = choose_next_request(&context).unwrap();
        assert_eq!(next.media_index, 2);
        assert_eq!(next.start_of_segment, 20.0);
        assert!(!next.is_sync_request);
    }

    #[test]
    fn test_preload_before_playback_starts() {
        let playlist = vod(10);
        let buffered = TimeRanges::single(0.0, 10.0);
        let mut context = ctx(&playlist, &buffered);
        context.has_played = false;
        assert_eq!(choose_next_request(&context), None);
        context.has_played = true;
        context.media_index = Some(0);
        assert_eq!(choose_next_request(&context).unwrap().media_index, 1);

        let partial = TimeRanges::single(0.0, 4.0);
        let mut context = ctx(&playlist, &partial);
        context.has_played = false;
        assert!(choose_next_request(&context).is_some());
    }

    #[test]
    fn test_preload_stops_after_one_short_part() {
        let mut playlist = vod(2);
        playlist.segments[0].duration = 1.0;
        playlist.segments[0].parts = parts(&[true, true, true, true]);
        for part in &mut playlist.segments[0].parts {
            part.duration = 0.25;
        }
        let buffered = TimeRanges::single(0.0, 0.25);
        let mut context = ctx(&playlist, &buffered);
        context.has_played = false;
        context.media_index = Some(0);
        context.part_index = Some(0);
        assert_eq!(choose_next_request(&context), None);

        context.has_played = true;
        let next = choose_next_request(&context).unwrap();
        assert_eq!((next.media_index, next.part_index), (0, Some(1)));
    }

    #[test]
    fn test_walk_forward_uses_segment_end() {
        let mut playlist = vod(10);
        playlist.segments[3].end = Some(40.5);
        let buffered = TimeRanges::single(0.0, 40.0);
        let mut context = ctx(&playlist, &buffered);
        context.current_time = 20.0;
        context.media_index = Some(3);
        let next = choose_next_request(&context).unwrap();
        assert_eq!(next.media_index, 4);
        assert_eq!(next.start_of_segment, 40.5);
    }

    #[test]
    fn test_end_of_stream_reached() {
        let playlist = vod(3);
        let buffered = TimeRanges::single(0.0, 20.0);
        let mut context = ctx(&playlist, &buffered);
        context.current_time = 15.0;
        context.media_index = Some(1);
        context.media_source_ended = true;
        assert_eq!(choose_next_request(&context), None);
        context.seeking = true;
        assert_eq!(choose_next_request(&context).unwrap().media_index, 2);

        context.media_index = Some(2);
        assert_eq!(choose_next_request(&context), None);
    }

    #[test]
    fn test_sync_request_without_sync_point() {
        let mut playlist = vod(6);
        playlist.end_list = false;
        let buffered = TimeRanges::new();
        let mut context = ctx(&playlist, &buffered);
        context.sync_point = None;
        let next = choose_next_request(&context).unwrap();
        assert!(next.is_sync_request);
        assert_eq!(next.media_index, 0);
        assert_eq!(next.start_of_segment, 0.0);
    }

    #[test]
    fn test_sync_segment_candidate() {
        let mut segments: Vec<Segment> = (0..5).map(|i| Segment::new(format!("{i}"), 4.0)).collect();
        segments[3].timeline = 1;
        segments[4].timeline = 1;
        assert_eq!(sync_segment_candidate(Some(0), &segments, 5.0), 1);
        assert_eq!(sync_segment_candidate(Some(0), &segments, 50.0), 2);
        assert_eq!(sync_segment_candidate(Some(1), &segments, 0.0), 3);
        assert_eq!(sync_segment_candidate(Some(7), &segments, 0.0), 0);
    }

    #[test]
    fn test_parts_step_back_to_independent_part() {
        let mut playlist = vod(2);
        playlist.end_list = false;
        playlist.segments[1].parts = parts(&[true, false, true, false]);
        let buffered = TimeRanges::new();
        let mut context = ctx(&playlist, &buffered);
        context.current_time = 11.5;
        let next = choose_next_request(&context).unwrap();
        assert_eq!((next.media_index, next.part_index), (1, Some(0)));

        // Independent segments disable the step back.
        context.main_independent_segments = true;
        let next = choose_next_request(&context).unwrap();
        assert_eq!((next.media_index, next.part_index), (1, Some(1)));
    }

    #[test]
    fn test_parts_step_back_into_previous_segment() {
        let mut playlist = vod(2);
        playlist.end_list = false;
        playlist.segments[0].duration = 2.0;
        playlist.segments[0].parts = parts(&[false, true]);
        playlist.segments[1].parts = parts(&[false, false]);
        let buffered = TimeRanges::new();
        let mut context = ctx(&playlist, &buffered);
        context.current_time = 2.2;
        let next = choose_next_request(&context).unwrap();
        assert_eq!((next.media_index, next.part_index), (0, Some(1)));

        playlist.independent_segments = true;
        let mut context = ctx(&playlist, &buffered);
        context.current_time = 2.2;
        let next = choose_next_request(&context).unwrap();
        assert_eq!((next.media_index, next.part_index), (1, Some(0)));
    }

    #[test]
    fn test_walk_forward_through_parts() {
        let mut playlist = vod(3);
        playlist.segments[1].parts = parts(&[true, false]);
        let buffered = TimeRanges::single(0.0, 11.0);
        let mut context = ctx(&playlist, &buffered);
        context.current_time = 10.5;
        context.media_index = Some(1);
        context.part_index = Some(0);
        let next = choose_next_request(&context).unwrap();
        assert_eq!((next.media_index, next.part_index), (1, Some(1)));

        context.part_index = Some(1);
        let next = choose_next_request(&context).unwrap();
        assert_eq!((next.media_index, next.part_index), (2, None));
    }
}
