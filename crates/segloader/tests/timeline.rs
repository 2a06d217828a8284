mod common;

use std::sync::Arc;
use std::time::Duration;

use segloader::testing::{FakeSegment, ManualPlayback, MemoryMediaBuffer, MemoryTextTrack};
use segloader::{
    Cue, LoaderEvent, LoaderKind, LoaderState, MediaBuffer, Playlist, Segment, SegmentTiming,
    SyncSource, TimelineChange, TimelineRole,
};

use common::{Harness, collect_for, until, wait_for, wait_for_appended};

fn audio_playlist() -> Playlist {
    let mut first = Segment::new("a0.ts", 10.0);
    first.timeline = 0;
    let mut second = Segment::new("a1.ts", 10.0);
    second.timeline = 1;
    second.discontinuity = true;
    let mut playlist = Playlist::new("audio.m3u8", 10.0, vec![first, second]);
    playlist.end_list = true;
    playlist
}

#[tokio::test(start_paused = true)]
async fn test_audio_waits_for_main_before_first_append() {
    let harness = Harness::with_buffers(ManualPlayback::vod(20.0), Some(MemoryMediaBuffer::new()), None);
    harness
        .transport
        .respond("a0.ts", FakeSegment::muxed(0.0, 10.0).audio_only().encode());
    harness
        .transport
        .respond("a1.ts", FakeSegment::muxed(0.0, 10.0).audio_only().encode());

    let loader = harness.loader(LoaderKind::Audio);
    let mut events = loader.subscribe();
    loader.playlist(audio_playlist());
    loader.load();

    let early = collect_for(&mut events, Duration::from_secs(2)).await;
    assert!(!early.iter().any(|e| matches!(e, LoaderEvent::Appended { .. })));
    assert_eq!(harness.transport.request_count("a0.ts"), 1);
    assert_eq!(loader.state(), LoaderState::Waiting);

    // Main starts loading timeline 0.
    harness.timelines.set_pending(TimelineChange {
        role: TimelineRole::Main,
        from: None,
        to: 0,
    });
    wait_for_appended(&mut events, 0).await;
    let last = harness.timelines.last(TimelineRole::Audio).unwrap();
    assert_eq!((last.from, last.to), (None, 0));
}

#[tokio::test(start_paused = true)]
async fn test_audio_request_parked_at_discontinuity() {
    let harness = Harness::with_buffers(ManualPlayback::vod(20.0), Some(MemoryMediaBuffer::new()), None);
    harness
        .transport
        .respond("a0.ts", FakeSegment::muxed(0.0, 10.0).audio_only().encode());
    harness
        .transport
        .respond("a1.ts", FakeSegment::muxed(0.0, 10.0).audio_only().encode());
    harness.timelines.set_last(TimelineChange {
        role: TimelineRole::Main,
        from: None,
        to: 0,
    });

    let loader = harness.loader(LoaderKind::Audio);
    let mut events = loader.subscribe();
    loader.playlist(audio_playlist());
    loader.load();
    wait_for_appended(&mut events, 0).await;

    let parked = collect_for(&mut events, Duration::from_secs(2)).await;
    assert!(!parked.iter().any(|e| matches!(e, LoaderEvent::Appending { .. })));
    assert_eq!(harness.transport.request_count("a1.ts"), 0);
    assert_eq!(loader.state(), LoaderState::Waiting);

    harness.timelines.set_last(TimelineChange {
        role: TimelineRole::Main,
        from: Some(0),
        to: 1,
    });
    let offset = wait_for(&mut events, |e| matches!(e, LoaderEvent::TimestampOffset { .. })).await;
    match offset {
        LoaderEvent::TimestampOffset { offset, .. } => assert_eq!(offset, 10.0),
        other => panic!("unexpected event {other:?}"),
    }
    wait_for_appended(&mut events, 1).await;
    assert_eq!(harness.audio().buffered().iter().collect::<Vec<_>>(), vec![(0.0, 20.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_subtitle_cues_wait_for_timeline_mapping() {
    let harness = Harness::new(ManualPlayback::vod(10.0));
    let mut playlist = Playlist::new("subs.m3u8", 10.0, vec![Segment::new("s0.vtt", 10.0)]);
    playlist.end_list = true;
    harness.transport.respond(
        "s0.vtt",
        FakeSegment::muxed(0.0, 10.0)
            .with_cue(Cue::new(0.5, 2.0, "hello"))
            .encode(),
    );

    let track = Arc::new(MemoryTextTrack::new());
    let loader = harness.loader(LoaderKind::Subtitle);
    let mut events = loader.subscribe();
    loader.set_text_track(track.clone());
    loader.playlist(playlist);
    loader.load();

    until(|| loader.state() == LoaderState::WaitingOnTimeline).await;
    assert!(track.cues().is_empty());

    harness.sync.save_segment_timing(&SegmentTiming {
        playlist_uri: "main.m3u8".to_string(),
        media_sequence: 0,
        timeline: 0,
        media_start: 0.0,
        start: 5.0,
        end: 15.0,
        discontinuity_start: false,
    });
    harness.timelines.set_last(TimelineChange {
        role: TimelineRole::Main,
        from: None,
        to: 0,
    });

    wait_for(&mut events, |e| matches!(e, LoaderEvent::AppendsDone)).await;
    let cues = track.cues();
    assert_eq!(cues.len(), 1);
    assert_eq!((cues[0].start, cues[0].end), (5.5, 7.0));
    assert_eq!(cues[0].text, "hello");
}

#[tokio::test(start_paused = true)]
async fn test_subtitle_loader_needs_text_track() {
    let harness = Harness::new(ManualPlayback::vod(10.0));
    let mut playlist = Playlist::new("subs.m3u8", 10.0, vec![Segment::new("s0.vtt", 10.0)]);
    playlist.end_list = true;

    let loader = harness.loader(LoaderKind::Subtitle);
    loader.playlist(playlist);
    loader.load();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(loader.state(), LoaderState::Init);
    assert!(harness.transport.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_demuxed_main_waits_for_audio_timeline() {
    let harness = Harness::new(ManualPlayback::vod(20.0));
    let mut main = Playlist::new(
        "main.m3u8",
        10.0,
        vec![Segment::new("v0.ts", 10.0), Segment::new("v1.ts", 10.0)],
    );
    main.end_list = true;
    harness
        .transport
        .respond("v0.ts", FakeSegment::muxed(0.0, 10.0).video_only().encode());
    harness
        .transport
        .respond("v1.ts", FakeSegment::muxed(10.0, 20.0).video_only().encode());

    let loader = harness.loader(LoaderKind::Main);
    let mut events = loader.subscribe();
    loader.set_audio(false);
    loader.playlist(main);
    loader.load();

    let held = collect_for(&mut events, Duration::from_secs(2)).await;
    assert!(!held.iter().any(|e| matches!(e, LoaderEvent::Appended { .. })));
    assert_eq!(harness.transport.request_count("v0.ts"), 1);
    assert_eq!(loader.state(), LoaderState::Waiting);

    // The alternate audio loader starts on timeline 0.
    harness.timelines.set_pending(TimelineChange {
        role: TimelineRole::Audio,
        from: None,
        to: 0,
    });
    wait_for_appended(&mut events, 0).await;
    assert_eq!(harness.video().buffered().iter().collect::<Vec<_>>(), vec![(0.0, 10.0)]);
    assert!(harness.audio().appended().is_empty());
    let last = harness.timelines.last(TimelineRole::Main).unwrap();
    assert_eq!((last.from, last.to), (None, 0));
}
