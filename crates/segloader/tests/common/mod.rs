#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use segloader::testing::{FakeSegment, ManualPlayback, MemoryMediaBuffer, MockTransmuxer, MockTransport};
use segloader::{
    LoaderConfig, LoaderDeps, LoaderEvent, LoaderKind, MediaBuffer, Playlist, Segment,
    SegmentLoader, SourceUpdater, SyncController, TimelineChangeController,
};
use tokio::sync::broadcast;

#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub transmuxer: Arc<MockTransmuxer>,
    pub playback: Arc<ManualPlayback>,
    pub audio: Option<Arc<MemoryMediaBuffer>>,
    pub video: Option<Arc<MemoryMediaBuffer>>,
    pub updater: Arc<SourceUpdater>,
    pub timelines: Arc<TimelineChangeController>,
    pub sync: Arc<SyncController>,
}

impl Harness {
    pub fn new(playback: ManualPlayback) -> Self {
        Self::with_buffers(
            playback,
            Some(MemoryMediaBuffer::new()),
            Some(MemoryMediaBuffer::new()),
        )
    }

    pub fn with_buffers(
        playback: ManualPlayback,
        audio: Option<MemoryMediaBuffer>,
        video: Option<MemoryMediaBuffer>,
    ) -> Self {
        init_tracing();
        let audio = audio.map(Arc::new);
        let video = video.map(Arc::new);
        let updater = SourceUpdater::new(
            audio.clone().map(|b| b as Arc<dyn MediaBuffer>),
            video.clone().map(|b| b as Arc<dyn MediaBuffer>),
        );
        Self {
            transport: Arc::new(MockTransport::new()),
            transmuxer: Arc::new(MockTransmuxer::new()),
            playback: Arc::new(playback),
            audio,
            video,
            updater: Arc::new(updater),
            timelines: Arc::new(TimelineChangeController::new()),
            sync: Arc::new(SyncController::new()),
        }
    }

    pub fn with_transport(mut self, transport: MockTransport) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    pub fn video(&self) -> &MemoryMediaBuffer {
        self.video.as_deref().expect("video buffer attached")
    }

    pub fn audio(&self) -> &MemoryMediaBuffer {
        self.audio.as_deref().expect("audio buffer attached")
    }

    pub fn deps(&self) -> LoaderDeps {
        LoaderDeps {
            transport: self.transport.clone(),
            transmuxer: self.transmuxer.clone(),
            sync: self.sync.clone(),
            playback: self.playback.clone(),
            source_updater: self.updater.clone(),
            timelines: self.timelines.clone(),
        }
    }

    pub fn loader(&self, kind: LoaderKind) -> SegmentLoader {
        self.loader_with(kind, config())
    }

    pub fn loader_with(&self, kind: LoaderKind, config: LoaderConfig) -> SegmentLoader {
        SegmentLoader::new(kind, config, self.deps())
    }

    /// Register muxed fake segments back to back from `start` seconds.
    pub fn serve(&self, playlist: &Playlist, start: f64) {
        let mut time = start;
        for segment in &playlist.segments {
            let payload = FakeSegment::muxed(time, time + segment.duration);
            self.transport.respond(segment.uri.clone(), payload.encode());
            time += segment.duration;
        }
    }
}

pub fn config() -> LoaderConfig {
    LoaderConfig::builder()
        .with_goal_buffer_length(30.0)
        .with_buffer_check_interval(Duration::from_millis(100))
        .build()
}

pub fn playlist(uri: &str, prefix: &str, count: usize, duration: f64, end_list: bool) -> Playlist {
    let segments = (0..count)
        .map(|i| Segment::new(format!("{prefix}{i}.ts"), duration))
        .collect();
    let mut playlist = Playlist::new(uri, duration, segments);
    playlist.end_list = end_list;
    playlist
}

/// Next event matching `pred`; panics after a minute of (virtual) time.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<LoaderEvent>, mut pred: F) -> LoaderEvent
where
    F: FnMut(&LoaderEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("loader event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .expect("expected loader event was not emitted")
}

pub async fn wait_for_appended(rx: &mut broadcast::Receiver<LoaderEvent>, index: usize) {
    wait_for(rx, |e| matches!(e, LoaderEvent::Appended { media_index, .. } if *media_index == index)).await;
}

/// Everything emitted during `duration`.
pub async fn collect_for(rx: &mut broadcast::Receiver<LoaderEvent>, duration: Duration) -> Vec<LoaderEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return events,
        }
    }
}

/// Poll `cond` until it holds; panics after a minute of (virtual) time.
pub async fn until<F: FnMut() -> bool>(mut cond: F) {
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(60), poll)
        .await
        .expect("condition not reached");
}
