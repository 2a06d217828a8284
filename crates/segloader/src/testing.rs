//! In-memory collaborators for driving loaders without a network, decoder or
//! media element.
//!
//! Segments are described by a small text format understood by
//! [`MockTransmuxer`]:
//!
//! ```text
//! FAKESEG <start ticks> <end ticks> <has audio 0|1> <has video 0|1>
//! CUE <start> <end> <text>
//! ```
//!
//! Init segments are `FAKEINIT <has audio> <has video>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::buffer::{AppendPayload, MediaBuffer, MediaType};
use crate::error::{BufferError, RequestError, TransmuxError};
use crate::playback::Playback;
use crate::ranges::TimeRanges;
use crate::text_track::{Cue, TextTrack};
use crate::transmux::{ONE_SECOND_IN_TS, TrackInfo, TransmuxJob, TransmuxMessage, Transmuxer};
use crate::transport::{HttpTransport, MediaRequest, MediaResponse, ProgressSender, RequestProgress};

/// A segment in the text format read by [`MockTransmuxer`].
#[derive(Debug, Clone, PartialEq)]
pub struct FakeSegment {
    /// 90 kHz ticks.
    pub start: u64,
    pub end: u64,
    pub has_audio: bool,
    pub has_video: bool,
    pub cues: Vec<Cue>,
}

impl FakeSegment {
    /// Audio and video covering `[start, end)` seconds.
    pub fn muxed(start: f64, end: f64) -> Self {
        Self::from_ticks(
            (start * ONE_SECOND_IN_TS as f64) as u64,
            (end * ONE_SECOND_IN_TS as f64) as u64,
        )
    }

    pub fn from_ticks(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            has_audio: true,
            has_video: true,
            cues: Vec::new(),
        }
    }

    pub fn audio_only(mut self) -> Self {
        self.has_video = false;
        self
    }

    pub fn video_only(mut self) -> Self {
        self.has_audio = false;
        self
    }

    pub fn with_cue(mut self, cue: Cue) -> Self {
        self.cues.push(cue);
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut text = format!(
            "FAKESEG {} {} {} {}\n",
            self.start, self.end, self.has_audio as u8, self.has_video as u8
        );
        for cue in &self.cues {
            text.push_str(&format!("CUE {} {} {}\n", cue.start, cue.end, cue.text));
        }
        Bytes::from(text)
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let mut lines = text.lines();
        let header: Vec<&str> = lines.next()?.split_whitespace().collect();
        if header.len() != 5 || header[0] != "FAKESEG" {
            return None;
        }
        let mut segment = Self {
            start: header[1].parse().ok()?,
            end: header[2].parse().ok()?,
            has_audio: header[3] == "1",
            has_video: header[4] == "1",
            cues: Vec::new(),
        };
        for line in lines {
            let mut fields = line.splitn(4, ' ');
            if fields.next() != Some("CUE") {
                continue;
            }
            let start = fields.next()?.parse().ok()?;
            let end = fields.next()?.parse().ok()?;
            let text = fields.next().unwrap_or_default();
            segment.cues.push(Cue::new(start, end, text));
        }
        Some(segment)
    }
}

pub fn fake_init(track_info: TrackInfo) -> Bytes {
    Bytes::from(format!(
        "FAKEINIT {} {}",
        track_info.has_audio as u8, track_info.has_video as u8
    ))
}

fn decode_init(bytes: &[u8]) -> Option<TrackInfo> {
    let text = std::str::from_utf8(bytes).ok()?;
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 3 || fields[0] != "FAKEINIT" {
        return None;
    }
    let has_audio = fields[1] == "1";
    let has_video = fields[2] == "1";
    Some(TrackInfo {
        has_audio,
        has_video,
        is_muxed: has_audio && has_video,
    })
}

/// Transmuxer for [`FakeSegment`] payloads. Data for each type is the
/// segment bytes themselves.
#[derive(Debug)]
pub struct MockTransmuxer {
    held: watch::Sender<bool>,
    pushed: AtomicUsize,
    probed: AtomicUsize,
}

impl Default for MockTransmuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransmuxer {
    pub fn new() -> Self {
        let (held, _) = watch::channel(false);
        Self {
            held,
            pushed: AtomicUsize::new(0),
            probed: AtomicUsize::new(0),
        }
    }

    /// Stall all transmux output until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    pub fn pushed(&self) -> usize {
        self.pushed.load(Ordering::SeqCst)
    }

    pub fn probed(&self) -> usize {
        self.probed.load(Ordering::SeqCst)
    }

    fn messages(job: &TransmuxJob) -> Vec<TransmuxMessage> {
        let Some(segment) = FakeSegment::decode(&job.bytes) else {
            return vec![TransmuxMessage::Error("unrecognized segment payload".to_string())];
        };
        let mut messages = vec![TransmuxMessage::TrackInfo(TrackInfo {
            has_audio: segment.has_audio,
            has_video: segment.has_video,
            is_muxed: segment.has_audio && segment.has_video,
        })];
        let mut types = Vec::new();
        if segment.has_video {
            types.push(MediaType::Video);
        }
        if segment.has_audio {
            types.push(MediaType::Audio);
        }
        for media_type in types {
            messages.push(TransmuxMessage::TimingInfo {
                media_type,
                start: segment.start,
                end: segment.end,
            });
            messages.push(TransmuxMessage::Data {
                media_type,
                bytes: job.bytes.clone(),
            });
        }
        if !segment.cues.is_empty() {
            messages.push(TransmuxMessage::Captions(segment.cues));
        }
        messages.push(TransmuxMessage::Done);
        messages
    }
}

#[async_trait]
impl Transmuxer for MockTransmuxer {
    fn push(&self, job: TransmuxJob) -> mpsc::Receiver<TransmuxMessage> {
        self.pushed.fetch_add(1, Ordering::SeqCst);
        let messages = Self::messages(&job);
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        let mut held = self.held.subscribe();
        tokio::spawn(async move {
            loop {
                let is_held = *held.borrow_and_update();
                if !is_held {
                    break;
                }
                if held.changed().await.is_err() {
                    return;
                }
            }
            for message in messages {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    async fn probe_init_segment(&self, bytes: Bytes) -> Result<TrackInfo, TransmuxError> {
        self.probed.fetch_add(1, Ordering::SeqCst);
        decode_init(&bytes).ok_or_else(|| TransmuxError::Probe("unrecognized init segment".to_string()))
    }
}

#[derive(Debug, Clone)]
enum Route {
    Respond(Bytes),
    Fail(u16),
    Hang,
}

#[derive(Debug, Default)]
struct TransportState {
    routes: HashMap<String, Route>,
    requests: Vec<MediaRequest>,
}

/// Transport serving registered payloads. Unknown uris get a 404.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<TransportState>,
    latency: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn respond(&self, uri: impl Into<String>, bytes: impl Into<Bytes>) {
        self.state
            .lock()
            .routes
            .insert(uri.into(), Route::Respond(bytes.into()));
    }

    pub fn fail(&self, uri: impl Into<String>, status: u16) {
        self.state.lock().routes.insert(uri.into(), Route::Fail(status));
    }

    /// Requests for `uri` never complete unless they time out.
    pub fn hang(&self, uri: impl Into<String>) {
        self.state.lock().routes.insert(uri.into(), Route::Hang);
    }

    pub fn requests(&self) -> Vec<MediaRequest> {
        self.state.lock().requests.clone()
    }

    pub fn request_count(&self, uri: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.uri == uri)
            .count()
    }

    async fn serve(&self, request: &MediaRequest, progress: Option<ProgressSender>) -> Result<MediaResponse, RequestError> {
        let started = Instant::now();
        let route = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            state.routes.get(&request.uri).cloned()
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let bytes = match route {
            Some(Route::Respond(bytes)) => bytes,
            Some(Route::Fail(status)) => {
                return Err(RequestError::Status {
                    uri: request.uri.clone(),
                    status,
                });
            }
            Some(Route::Hang) => std::future::pending().await,
            None => {
                return Err(RequestError::Status {
                    uri: request.uri.clone(),
                    status: 404,
                });
            }
        };
        let bytes = match request.byte_range {
            Some(range) => {
                let start = (range.offset as usize).min(bytes.len());
                let end = (start + range.length as usize).min(bytes.len());
                bytes.slice(start..end)
            }
            None => bytes,
        };
        if let Some(progress) = progress {
            let _ = progress.send(RequestProgress {
                uri: request.uri.clone(),
                bytes_received: bytes.len() as u64,
                total: Some(bytes.len() as u64),
                elapsed: started.elapsed(),
            });
        }
        Ok(MediaResponse {
            uri: request.uri.clone(),
            status: 200,
            bytes,
            elapsed: started.elapsed(),
        })
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn request(
        &self,
        request: MediaRequest,
        progress: Option<ProgressSender>,
    ) -> Result<MediaResponse, RequestError> {
        match request.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.serve(&request, progress))
                .await
                .map_err(|_| RequestError::Timeout(request.uri.clone()))?,
            None => self.serve(&request, progress).await,
        }
    }
}

#[derive(Debug)]
struct Entry {
    start: f64,
    end: f64,
    bytes: usize,
}

#[derive(Debug, Default)]
struct BufferState {
    buffered: TimeRanges,
    offset: f64,
    entries: Vec<Entry>,
    appended: Vec<AppendPayload>,
    removed: Vec<(f64, f64)>,
    failures: Vec<BufferError>,
}

/// Media buffer keeping buffered ranges from the payload spans, shifted by
/// the timestamp offset.
#[derive(Debug, Default)]
pub struct MemoryMediaBuffer {
    state: Mutex<BufferState>,
    delay: Duration,
    quota: Option<usize>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    aborts: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryMediaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every append and remove takes this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_buffered(self, start: f64, end: f64) -> Self {
        {
            let mut state = self.state.lock();
            state.buffered.insert(start, end);
            state.entries.push(Entry { start, end, bytes: 0 });
        }
        self
    }

    /// Appends fail with `QuotaExceeded` once this many bytes are held.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Fail the next append with `error`.
    pub fn push_failure(&self, error: BufferError) {
        self.state.lock().failures.push(error);
    }

    pub fn max_concurrent_operations(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn appended(&self) -> Vec<AppendPayload> {
        self.state.lock().appended.clone()
    }

    pub fn removed(&self) -> Vec<(f64, f64)> {
        self.state.lock().removed.clone()
    }

    pub fn bytes_held(&self) -> usize {
        self.state.lock().entries.iter().map(|e| e.bytes).sum()
    }

    async fn operation(&self) -> ActiveGuard<'_> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let guard = ActiveGuard(&self.active);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        guard
    }
}

#[async_trait]
impl MediaBuffer for MemoryMediaBuffer {
    async fn append(&self, payload: AppendPayload) -> Result<(), BufferError> {
        let _guard = self.operation().await;
        let mut state = self.state.lock();
        if !state.failures.is_empty() {
            return Err(state.failures.remove(0));
        }
        let held: usize = state.entries.iter().map(|e| e.bytes).sum();
        if self.quota.is_some_and(|quota| held + payload.len() > quota) {
            return Err(BufferError::QuotaExceeded);
        }
        if let Some((start, end)) = payload.span {
            let offset = state.offset;
            state.buffered.insert(start + offset, end + offset);
            state.entries.push(Entry {
                start: start + offset,
                end: end + offset,
                bytes: payload.len(),
            });
        }
        state.appended.push(payload);
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> Result<(), BufferError> {
        let _guard = self.operation().await;
        let mut state = self.state.lock();
        state.buffered.remove(start, end);
        state.entries.retain(|e| !(e.start >= start && e.end <= end));
        state.removed.push((start, end));
        Ok(())
    }

    fn set_timestamp_offset(&self, offset: f64) {
        self.state.lock().offset = offset;
    }

    fn timestamp_offset(&self) -> f64 {
        self.state.lock().offset
    }

    fn buffered(&self) -> TimeRanges {
        self.state.lock().buffered.clone()
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct PlaybackState {
    current_time: f64,
    duration: f64,
    seekable: TimeRanges,
    seeking: bool,
    has_played: bool,
    ended: bool,
}

/// Playback state set by hand.
#[derive(Debug)]
pub struct ManualPlayback {
    state: RwLock<PlaybackState>,
}

impl Default for ManualPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualPlayback {
    /// Live, playing from time zero.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PlaybackState {
                current_time: 0.0,
                duration: f64::INFINITY,
                seekable: TimeRanges::new(),
                seeking: false,
                has_played: true,
                ended: false,
            }),
        }
    }

    pub fn vod(duration: f64) -> Self {
        let playback = Self::new();
        {
            let mut state = playback.state.write();
            state.duration = duration;
            state.seekable = TimeRanges::single(0.0, duration);
        }
        playback
    }

    pub fn set_current_time(&self, time: f64) {
        self.state.write().current_time = time;
    }

    pub fn set_duration(&self, duration: f64) {
        self.state.write().duration = duration;
    }

    pub fn set_seekable(&self, start: f64, end: f64) {
        self.state.write().seekable = TimeRanges::single(start, end);
    }

    pub fn set_seeking(&self, seeking: bool) {
        self.state.write().seeking = seeking;
    }

    pub fn set_has_played(&self, has_played: bool) {
        self.state.write().has_played = has_played;
    }

    pub fn set_ended(&self, ended: bool) {
        self.state.write().ended = ended;
    }
}

impl Playback for ManualPlayback {
    fn current_time(&self) -> f64 {
        self.state.read().current_time
    }

    fn duration(&self) -> f64 {
        self.state.read().duration
    }

    fn seekable(&self) -> TimeRanges {
        self.state.read().seekable.clone()
    }

    fn seeking(&self) -> bool {
        self.state.read().seeking
    }

    fn has_played(&self) -> bool {
        self.state.read().has_played
    }

    fn ended(&self) -> bool {
        self.state.read().ended
    }
}

/// Text track holding cues in memory.
#[derive(Debug, Default)]
pub struct MemoryTextTrack {
    cues: Mutex<Vec<Cue>>,
}

impl MemoryTextTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cues(&self) -> Vec<Cue> {
        self.cues.lock().clone()
    }
}

impl TextTrack for MemoryTextTrack {
    fn add_cues(&self, cues: Vec<Cue>) {
        self.cues.lock().extend(cues);
    }

    fn remove_cues(&self, start: f64, end: f64) {
        self.cues
            .lock()
            .retain(|cue| cue.end <= start || cue.start >= end);
    }

    fn buffered(&self) -> TimeRanges {
        let mut ranges = TimeRanges::new();
        for cue in self.cues.lock().iter() {
            ranges.insert(cue.start, cue.end);
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_segment_decodes_cues() {
        let segment = FakeSegment::muxed(0.0, 2.0)
            .audio_only()
            .with_cue(Cue::new(0.5, 1.5, "hello there"));
        let decoded = FakeSegment::decode(&segment.encode()).unwrap();
        assert_eq!(decoded.end, 180_000);
        assert!(!decoded.has_video);
        assert_eq!(decoded.cues[0].text, "hello there");
        assert!(FakeSegment::decode(b"garbage").is_none());
    }

    #[tokio::test]
    async fn test_memory_buffer_quota_and_remove() {
        let buffer = MemoryMediaBuffer::new().with_quota(10);
        buffer
            .append(AppendPayload::new(Bytes::from_static(b"12345678")).with_span(0.0, 4.0))
            .await
            .unwrap();
        let second = AppendPayload::new(Bytes::from_static(b"12345")).with_span(4.0, 8.0);
        assert_eq!(buffer.append(second.clone()).await, Err(BufferError::QuotaExceeded));

        buffer.remove(0.0, 4.0).await.unwrap();
        assert_eq!(buffer.bytes_held(), 0);
        buffer.append(second).await.unwrap();
        assert_eq!(buffer.buffered().iter().collect::<Vec<_>>(), vec![(4.0, 8.0)]);
    }

    #[tokio::test]
    async fn test_mock_transport_routes() {
        let transport = MockTransport::new();
        transport.respond("a.ts", Bytes::from_static(b"abc"));
        transport.fail("b.ts", 500);

        let response = transport
            .request(MediaRequest::new("a.ts", crate::transport::RequestKind::Segment), None)
            .await
            .unwrap();
        assert_eq!(response.bytes, Bytes::from_static(b"abc"));
        let err = transport
            .request(MediaRequest::new("b.ts", crate::transport::RequestKind::Segment), None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        let err = transport
            .request(MediaRequest::new("c.ts", crate::transport::RequestKind::Segment), None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(transport.request_count("a.ts"), 1);
    }
}
