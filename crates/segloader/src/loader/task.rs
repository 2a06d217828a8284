//! The loader's event loop. All mutable loader state lives here and is only
//! touched from this task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, join_all};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{AppendPayload, MediaType};
use crate::config::LoaderConfig;
use crate::crypto::{KEY_LENGTH, KeyCache, segment_iv};
use crate::error::{BufferError, ErrorKind, LoaderError, RequestError};
use crate::events::{EventEmitter, LoaderEvent};
use crate::playlist::Playlist;
use crate::ranges::TimeRanges;
use crate::source_updater::SourceUpdater;
use crate::sync::{SegmentTiming, SyncPoint};
use crate::text_track::{Cue, TextTrack};
use crate::timeline::{TimelineChange, TimelineEvent};
use crate::transmux::TrackInfo;
use crate::transport::{MediaRequest, RequestKind};

use super::pipeline::{self, FetchPlan, Fetched, InitMaterial, KeyMaterial, ProcessJob};
use super::segment::{
    AppendStage, PendingSegment, Phase, Processed, RequestStats, SegmentInfo, SegmentRef,
    WaitStage,
};
use super::selection::{NextRequest, SelectionContext, choose_next_request};
use super::timing::{
    RolloverTracker, illegal_media_switch, safe_back_buffer_trim_time,
    should_wait_for_timeline_change, timestamp_offset_for_segment,
};
use super::{LoaderDeps, LoaderKind, LoaderStats, Shared};

/// Bandwidth reported after a failed request so the sample is not trusted.
const BANDWIDTH_SENTINEL: f64 = 1.0;

pub(crate) enum Command {
    Playlist(Box<Playlist>),
    Load,
    Pause,
    Abort,
    Dispose,
    Remove {
        start: f64,
        end: f64,
        done: oneshot::Sender<()>,
    },
    SetAudio(bool),
    SetTextTrack(Arc<dyn TextTrack>),
    SetMainIndependentSegments(bool),
}

struct AppendOutcome {
    media_type: MediaType,
    payload: AppendPayload,
    result: Result<(), BufferError>,
}

#[derive(Debug, Clone)]
struct CachedInit {
    bytes: Bytes,
    track_info: Option<TrackInfo>,
}

async fn poll_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn enqueue_appends(
    updater: &Arc<SourceUpdater>,
    payloads: Vec<(MediaType, AppendPayload)>,
) -> BoxFuture<'static, Vec<AppendOutcome>> {
    let pending: Vec<_> = payloads
        .into_iter()
        .map(|(media_type, payload)| {
            let completion = updater.append_buffer(media_type, payload.clone());
            async move {
                AppendOutcome {
                    media_type,
                    payload,
                    result: completion.await,
                }
            }
        })
        .collect();
    Box::pin(join_all(pending))
}

pub(crate) struct LoaderTask {
    kind: LoaderKind,
    config: Arc<LoaderConfig>,
    deps: LoaderDeps,
    events: EventEmitter,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    timeline_events: broadcast::Receiver<TimelineEvent>,

    phase: Phase,
    playlist: Option<Playlist>,
    media_index: Option<usize>,
    part_index: Option<usize>,
    sync_point: Option<SyncPoint>,
    current_timeline: Option<u64>,
    fetch_at_buffer: bool,
    force_timestamp_offset: bool,
    starting_media: Option<TrackInfo>,
    current_media: Option<TrackInfo>,
    audio_disabled: bool,
    main_independent_segments: bool,
    text_track: Option<Arc<dyn TextTrack>>,
    key_cache: KeyCache,
    init_segments: HashMap<String, CachedInit>,
    appended_init: HashMap<MediaType, String>,
    rollover: RolloverTracker,
    ended_emitted: bool,
    stats: LoaderStats,

    check_at: Option<Instant>,
    network: Option<BoxFuture<'static, Result<Fetched, RequestError>>>,
    processing: Option<BoxFuture<'static, Result<Processed, LoaderError>>>,
    appending: Option<BoxFuture<'static, Vec<AppendOutcome>>>,
    freeing: Option<BoxFuture<'static, ()>>,
    quota_retry_at: Option<Instant>,
}

impl LoaderTask {
    pub(crate) fn new(
        kind: LoaderKind,
        config: Arc<LoaderConfig>,
        deps: LoaderDeps,
        events: EventEmitter,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let timeline_events = deps.timelines.subscribe();
        let stats = LoaderStats {
            bandwidth: config.initial_bandwidth,
            ..LoaderStats::default()
        };
        Self {
            kind,
            key_cache: KeyCache::new(config.cache_encryption_keys),
            config,
            deps,
            events,
            shared,
            commands,
            timeline_events,
            phase: Phase::Init,
            playlist: None,
            media_index: None,
            part_index: None,
            sync_point: None,
            current_timeline: None,
            fetch_at_buffer: false,
            force_timestamp_offset: false,
            starting_media: None,
            current_media: None,
            audio_disabled: false,
            main_independent_segments: false,
            text_track: None,
            init_segments: HashMap::new(),
            appended_init: HashMap::new(),
            rollover: RolloverTracker::default(),
            ended_emitted: false,
            stats,
            check_at: None,
            network: None,
            processing: None,
            appending: None,
            freeing: None,
            quota_retry_at: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(loader = %self.kind, "Segment loader started");
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Dispose) | None => {
                        self.dispose();
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                outcome = poll_slot(&mut self.appending) => {
                    self.appending = None;
                    self.on_append_complete(outcome);
                }
                () = poll_slot(&mut self.freeing) => {
                    self.freeing = None;
                    self.on_space_freed();
                }
                () = sleep_until_opt(self.quota_retry_at) => {
                    self.quota_retry_at = None;
                    self.retry_quota_append();
                }
                result = poll_slot(&mut self.processing) => {
                    self.processing = None;
                    self.on_processed(result);
                }
                result = poll_slot(&mut self.network) => {
                    self.network = None;
                    self.on_network_complete(result);
                }
                event = self.timeline_events.recv() => self.on_timeline_event(event),
                () = sleep_until_opt(self.check_at) => {
                    self.check_at = None;
                    self.on_buffer_check();
                }
            }
            self.publish();
        }
        self.publish();
        info!(loader = %self.kind, "Segment loader stopped");
    }

    fn publish(&self) {
        let mut snapshot = self.shared.snapshot.write();
        snapshot.state = self.phase.state();
        snapshot.media_index = self.media_index;
        snapshot.part_index = self.part_index;
        snapshot.current_timeline = self.current_timeline;
        snapshot.stats = self.stats.clone();
    }

    fn paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Playlist(playlist) => self.set_playlist(*playlist),
            Command::Load => self.load(),
            Command::Pause => self.pause(),
            Command::Abort => self.abort(),
            Command::Remove { start, end, done } => {
                let removal = self.remove(start, end);
                tokio::spawn(async move {
                    removal.await;
                    let _ = done.send(());
                });
            }
            Command::SetAudio(enabled) => self.set_audio(enabled),
            Command::SetTextTrack(track) => {
                self.text_track = Some(track);
                if matches!(self.phase, Phase::Init) && self.could_begin_loading() {
                    self.init_loading();
                }
            }
            Command::SetMainIndependentSegments(independent) => {
                self.main_independent_segments = independent;
            }
            // Handled by the run loop.
            Command::Dispose => {}
        }
    }

    // ---- lifecycle ----

    fn could_begin_loading(&self) -> bool {
        self.playlist.is_some()
            && !self.paused()
            && (self.kind != LoaderKind::Subtitle || self.text_track.is_some())
    }

    fn init_loading(&mut self) {
        debug!(loader = %self.kind, "Loader ready");
        self.phase = Phase::Ready;
        self.monitor_buffer();
    }

    fn load(&mut self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.monitor_buffer();
        if self.playlist.is_none() {
            return;
        }
        if matches!(self.phase, Phase::Init) && self.could_begin_loading() {
            self.init_loading();
        }
    }

    fn pause(&mut self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.check_at = None;
    }

    fn monitor_buffer(&mut self) {
        self.check_at = Some(Instant::now());
    }

    fn on_buffer_check(&mut self) {
        if self.paused() {
            return;
        }
        match &self.phase {
            Phase::Ready => self.fill_buffer(),
            Phase::Waiting(_, WaitStage::Parked) => self.retry_parked(),
            Phase::Waiting(_, WaitStage::Gated(_)) => self.retry_gated(),
            Phase::WaitingOnTimeline(..) => self.retry_waiting_on_timeline(),
            _ => {}
        }
        if !self.paused() {
            self.check_at = Some(Instant::now() + self.config.buffer_check_interval);
        }
    }

    fn on_timeline_event(&mut self, event: Result<TimelineEvent, broadcast::error::RecvError>) {
        match event {
            Ok(event) => trace!(loader = %self.kind, ?event, "Timeline event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(loader = %self.kind, skipped, "Timeline events lagged")
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
        match &self.phase {
            Phase::Waiting(_, WaitStage::Parked) => self.retry_parked(),
            Phase::Waiting(_, WaitStage::Gated(_)) => self.retry_gated(),
            Phase::WaitingOnTimeline(..) => self.retry_waiting_on_timeline(),
            _ => {}
        }
    }

    fn dispose(&mut self) {
        info!(loader = %self.kind, "Disposing loader");
        let offset_pending = self.phase.pending_mut().is_some_and(|pending| {
            pending.token.cancel();
            pending.info.timestamp_offset.is_some()
        });
        if offset_pending {
            self.clear_pending_timeline();
        }
        self.network = None;
        self.processing = None;
        self.appending = None;
        self.freeing = None;
        self.quota_retry_at = None;
        self.check_at = None;
        self.key_cache.clear();
        self.init_segments.clear();
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.disposed.store(true, Ordering::SeqCst);
    }

    fn clear_pending_timeline(&self) {
        if let Some(role) = self.kind.timeline_role() {
            self.deps.timelines.clear_pending(role);
        }
    }

    /// Report an error, drop the unit of work and pause.
    fn fail(&mut self, err: LoaderError) {
        if err.is_fatal() {
            error!(loader = %self.kind, kind = ?err.kind, uri = ?err.uri, "{}", err.message);
        } else {
            warn!(loader = %self.kind, kind = ?err.kind, uri = ?err.uri, "{}", err.message);
        }
        let offset_pending = self
            .phase
            .pending_mut()
            .is_some_and(|pending| pending.info.timestamp_offset.is_some());
        if offset_pending {
            self.clear_pending_timeline();
        }
        self.phase = Phase::Ready;
        self.pause();
        self.events.emit(LoaderEvent::Error(err));
    }

    // ---- playlist handling ----

    fn set_playlist(&mut self, mut playlist: Playlist) {
        if playlist.discontinuity_starts.is_empty() {
            playlist.discontinuity_starts = playlist.compute_discontinuity_starts();
        }
        let old = self.playlist.take();

        match old {
            None => {
                debug!(loader = %self.kind, uri = %playlist.uri, "Playlist assigned");
                self.playlist = Some(playlist);
            }
            Some(old) if old.uri != playlist.uri => {
                info!(loader = %self.kind, from = %old.uri, to = %playlist.uri, "Rendition switch");
                let reset = playlist.is_low_latency() || old.supports_parts() != playlist.supports_parts();
                self.playlist = Some(playlist);
                if self.media_index.is_some() || self.phase.has_pending() {
                    if reset {
                        self.reset_loader();
                    } else {
                        self.resync_loader();
                    }
                }
                self.current_media = None;
                self.ended_emitted = false;
                self.events.emit(LoaderEvent::PlaylistUpdate);
            }
            Some(old) => {
                self.refresh_playlist(old, playlist);
            }
        }

        self.events.emit(LoaderEvent::SyncInfoUpdate);

        if matches!(self.phase, Phase::Init) && self.could_begin_loading() {
            self.init_loading();
        }
    }

    /// Same playlist, new contents: keep pointing at the same physical segments.
    fn refresh_playlist(&mut self, old: Playlist, mut new: Playlist) {
        let diff = new.media_sequence as i64 - old.media_sequence as i64;
        trace!(loader = %self.kind, uri = %new.uri, diff, "Live playlist refresh");

        // Carry learned timing over to segments both playlists share.
        for (i, segment) in new.segments.iter_mut().enumerate() {
            let old_index = i as i64 + diff;
            if old_index < 0 {
                continue;
            }
            if let Some(previous) = old.segments.get(old_index as usize) {
                segment.start = segment.start.or(previous.start);
                segment.end = segment.end.or(previous.end);
                if let (Some(map), Some(previous_map)) = (&mut segment.map, &previous.map)
                    && map.id() == previous_map.id()
                {
                    map.track_info = map.track_info.or(previous_map.track_info);
                }
            }
        }

        if let Some(index) = self.media_index {
            let shifted = index as i64 - diff;
            if shifted < 0 {
                self.media_index = None;
                self.part_index = None;
            } else {
                let shifted = shifted as usize;
                self.media_index = Some(shifted);
                if self.part_index.is_some()
                    && !new.segments.get(shifted).is_some_and(|s| s.has_parts())
                {
                    self.part_index = None;
                }
            }
        }

        if let Some(pending) = self.phase.pending_mut()
            && let SegmentRef::Active(index) = pending.info.segment
        {
            let shifted = index as i64 - diff;
            if shifted < 0 || shifted as usize >= new.segments.len() {
                debug!(loader = %self.kind, media_sequence = pending.info.media_sequence, "In-flight segment fell off the playlist");
                if let Some(segment) = old.segments.get(index) {
                    pending.info.segment = SegmentRef::Detached(Box::new(segment.clone()));
                }
            } else {
                let shifted = shifted as usize;
                pending.info.segment = SegmentRef::Active(shifted);
                pending.info.media_index = shifted;
                if !new.segments[shifted].has_parts() {
                    pending.info.part_index = None;
                }
            }
        }

        self.deps.sync.save_expired_segment_info(&old, &new);
        self.playlist = Some(new);
    }

    fn discard_pending(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Ready) {
            // An append already handed to the buffer queue finishes normally.
            phase @ Phase::Appending(_, AppendStage::Appending { .. }) => {
                self.phase = phase;
            }
            Phase::Init => self.phase = Phase::Init,
            Phase::Ready => {}
            Phase::Waiting(pending, stage) => {
                pending.token.cancel();
                if matches!(stage, WaitStage::Requesting) {
                    self.stats.media_requests_aborted += 1;
                }
                self.network = None;
                self.processing = None;
                if pending.info.timestamp_offset.is_some() {
                    self.clear_pending_timeline();
                }
            }
            Phase::WaitingOnTimeline(pending, _) | Phase::Appending(pending, _) => {
                pending.token.cancel();
                self.freeing = None;
                self.quota_retry_at = None;
                if pending.info.timestamp_offset.is_some() {
                    self.clear_pending_timeline();
                }
            }
        }
    }

    /// Keep the tracked index but re-derive timing against the new playlist.
    fn resync_loader(&mut self) {
        debug!(loader = %self.kind, "Resyncing loader");
        self.discard_pending();
        if let Some(playlist) = &self.playlist {
            match self.media_index {
                Some(index) if index < playlist.segments.len() => {
                    let segment = &playlist.segments[index];
                    if self.part_index.is_some_and(|part| part >= segment.parts.len()) {
                        self.part_index = None;
                    }
                }
                _ => {
                    self.media_index = None;
                    self.part_index = None;
                }
            }
        }
        self.sync_point = None;
        self.rollover.reset();
        self.force_timestamp_offset = true;
        if !self.paused() {
            self.monitor_buffer();
        }
    }

    fn reset_loader(&mut self) {
        debug!(loader = %self.kind, "Resetting loader");
        self.discard_pending();
        self.media_index = None;
        self.part_index = None;
        self.sync_point = None;
        self.rollover.reset();
        self.fetch_at_buffer = false;
        self.force_timestamp_offset = true;
        if !self.paused() {
            self.monitor_buffer();
        }
    }

    // ---- buffer views ----

    /// Tracks of the latest segment, falling back to the first one seen.
    fn media_info(&self) -> Option<TrackInfo> {
        self.current_media.or(self.starting_media)
    }

    fn buffered(&self) -> TimeRanges {
        let updater = &self.deps.source_updater;
        match self.kind {
            LoaderKind::Main => match self.media_info() {
                Some(media) if media.has_video && media.has_audio && !self.audio_disabled => {
                    updater.buffered()
                }
                Some(media) if media.has_video => updater.video_buffered(),
                Some(_) => updater.audio_buffered(),
                None => TimeRanges::new(),
            },
            LoaderKind::Audio => updater.audio_buffered(),
            LoaderKind::Subtitle => self
                .text_track
                .as_ref()
                .map(|track| track.buffered())
                .unwrap_or_default(),
        }
    }

    /// Buffer types this loader writes to.
    fn managed_types(&self) -> Vec<MediaType> {
        let updater = &self.deps.source_updater;
        let mut types = Vec::new();
        match self.kind {
            LoaderKind::Main => {
                let media = self.media_info().unwrap_or(TrackInfo::audio_video());
                if media.has_video && updater.has_buffer(MediaType::Video) {
                    types.push(MediaType::Video);
                }
                if media.has_audio && !self.audio_disabled && updater.has_buffer(MediaType::Audio) {
                    types.push(MediaType::Audio);
                }
            }
            LoaderKind::Audio => {
                if updater.has_buffer(MediaType::Audio) {
                    types.push(MediaType::Audio);
                }
            }
            LoaderKind::Subtitle => {}
        }
        types
    }

    fn remove(&self, start: f64, end: f64) -> BoxFuture<'static, ()> {
        debug!(loader = %self.kind, start, end, "Removing buffered content");
        if self.kind == LoaderKind::Subtitle {
            if let Some(track) = &self.text_track {
                track.remove_cues(start, end);
            }
            return Box::pin(async {});
        }
        let completions: Vec<_> = self
            .managed_types()
            .into_iter()
            .map(|media_type| self.deps.source_updater.remove(media_type, start, end))
            .collect();
        let kind = self.kind;
        Box::pin(async move {
            for result in join_all(completions).await {
                if let Err(err) = result {
                    warn!(loader = %kind, error = %err, "Remove failed");
                }
            }
        })
    }

    fn set_audio(&mut self, enabled: bool) {
        debug!(loader = %self.kind, enabled, "Audio handling toggled");
        if self.kind == LoaderKind::Main {
            let was_disabled = self.audio_disabled;
            self.audio_disabled = !enabled;
            self.deps.source_updater.set_audio_disabled(!enabled);
            if enabled {
                self.appended_init.remove(&MediaType::Audio);
            } else if !was_disabled && self.deps.source_updater.has_buffer(MediaType::Audio) {
                let duration = self.deps.playback.duration();
                let end = if duration.is_finite() { duration } else { f64::MAX };
                drop(self.deps.source_updater.remove(MediaType::Audio, 0.0, end));
            }
        } else {
            self.audio_disabled = !enabled;
        }
    }

    // ---- selection and requests ----

    fn fill_buffer(&mut self) {
        let Some(playlist) = &self.playlist else {
            return;
        };
        let playback = &self.deps.playback;
        let current_time = playback.current_time();

        if self.sync_point.is_none() {
            self.sync_point = self.deps.sync.sync_point(
                playlist,
                playback.duration(),
                self.current_timeline,
                current_time,
            );
        }

        let buffered = self.buffered();
        let next = choose_next_request(&SelectionContext {
            playlist,
            buffered: &buffered,
            current_time,
            has_played: playback.has_played(),
            seeking: playback.seeking(),
            media_source_ended: playback.ended(),
            goal_buffer_length: self.config.goal_buffer_length,
            media_index: self.media_index,
            part_index: self.part_index,
            sync_point: self.sync_point,
            current_timeline: self.current_timeline,
            fetch_at_buffer: self.fetch_at_buffer,
            main_independent_segments: self.main_independent_segments,
        });
        let Some(next) = next else {
            return;
        };
        let Some(info) = self.segment_info(&next, &buffered) else {
            return;
        };

        self.trim_back_buffer();
        self.load_segment(info);
    }

    fn segment_info(&self, next: &NextRequest, buffered: &TimeRanges) -> Option<SegmentInfo> {
        let playlist = self.playlist.as_ref()?;
        let segment = playlist.segments.get(next.media_index)?;
        let part = next.part_index.and_then(|i| segment.parts.get(i));
        let (uri, duration, byte_range) = match part {
            Some(part) => (part.uri.clone(), part.duration, part.byte_range),
            None => (segment.uri.clone(), segment.duration, segment.byte_range),
        };
        let timestamp_offset = timestamp_offset_for_segment(
            segment.timeline,
            self.current_timeline,
            next.start_of_segment,
            buffered,
            self.force_timestamp_offset,
        );
        Some(SegmentInfo {
            uri,
            media_index: next.media_index,
            part_index: next.part_index,
            media_sequence: playlist.media_sequence_of(next.media_index),
            timeline: segment.timeline,
            duration,
            discontinuity_start: playlist.discontinuity_starts.contains(&next.media_index),
            start_of_segment: next.start_of_segment,
            timestamp_offset,
            is_sync_request: next.is_sync_request,
            byte_range,
            key: segment.key.clone(),
            map: segment.map.clone(),
            segment: SegmentRef::Active(next.media_index),
            stats: RequestStats::default(),
            media_span: None,
            timing: None,
        })
    }

    fn trim_back_buffer(&self) {
        let Some(playlist) = &self.playlist else {
            return;
        };
        let playback = &self.deps.playback;
        let remove_to = safe_back_buffer_trim_time(
            &playback.seekable(),
            playback.current_time(),
            playlist.target_duration,
            self.config.back_buffer_length,
        );
        if remove_to > 0.0 {
            trace!(loader = %self.kind, remove_to, "Trimming back buffer");
            drop(self.remove(0.0, remove_to));
        }
    }

    fn must_wait_for_timeline(&self, timeline: u64) -> bool {
        should_wait_for_timeline_change(
            self.kind,
            self.current_timeline,
            timeline,
            &self.deps.timelines,
            self.audio_disabled,
        )
    }

    fn load_segment(&mut self, info: SegmentInfo) {
        let pending = Box::new(PendingSegment::new(info));
        // Secondary loaders hold back before crossing into a timeline main has not reached.
        let gated = self.kind != LoaderKind::Main
            && self.current_timeline.is_some()
            && self.must_wait_for_timeline(pending.info.timeline);
        if gated {
            debug!(
                loader = %self.kind,
                media_index = pending.info.media_index,
                timeline = pending.info.timeline,
                "Parking request until main reaches timeline"
            );
            self.phase = Phase::Waiting(pending, WaitStage::Parked);
            return;
        }
        self.start_request(pending);
    }

    fn retry_parked(&mut self) {
        let Phase::Waiting(pending, WaitStage::Parked) = std::mem::replace(&mut self.phase, Phase::Ready)
        else {
            return;
        };
        if self.must_wait_for_timeline(pending.info.timeline) {
            self.phase = Phase::Waiting(pending, WaitStage::Parked);
            return;
        }
        debug!(loader = %self.kind, timeline = pending.info.timeline, "Parked request released");
        self.start_request(pending);
    }

    fn start_request(&mut self, mut pending: Box<PendingSegment>) {
        let info = &mut pending.info;
        if info.timestamp_offset.is_some()
            && let Some(role) = self.kind.timeline_role()
        {
            self.deps.timelines.set_pending(TimelineChange {
                role,
                from: self.current_timeline,
                to: info.timeline,
            });
        }

        let timeout = self.config.request_timeout;
        let segment = MediaRequest::new(info.uri.clone(), RequestKind::Segment)
            .with_byte_range(info.byte_range)
            .with_timeout(timeout);
        let key = info
            .key
            .as_ref()
            .filter(|key| self.key_cache.get(&key.uri).is_none())
            .map(|key| MediaRequest::new(key.uri.clone(), RequestKind::Key).with_timeout(timeout));
        let init = info
            .map
            .as_ref()
            .filter(|map| !self.init_segments.contains_key(&map.id()))
            .map(|map| {
                MediaRequest::new(map.uri.clone(), RequestKind::InitSegment)
                    .with_byte_range(map.byte_range)
                    .with_timeout(timeout)
            });

        debug!(
            loader = %self.kind,
            media_index = info.media_index,
            part_index = ?info.part_index,
            timeline = info.timeline,
            sync_request = info.is_sync_request,
            uri = %info.uri,
            key_request = key.is_some(),
            init_request = init.is_some(),
            "Requesting segment"
        );

        info.stats.requested_at = Some(Instant::now());
        self.network = Some(pipeline::fetch(
            self.deps.transport.clone(),
            FetchPlan { segment, key, init },
            self.events.clone(),
            pending.token.clone(),
        ));
        self.phase = Phase::Waiting(pending, WaitStage::Requesting);
    }

    fn abort(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Waiting(pending, WaitStage::Parked) => {
                debug!(loader = %self.kind, media_index = pending.info.media_index, "Dropping parked request");
            }
            Phase::Waiting(pending, WaitStage::Requesting) => {
                debug!(loader = %self.kind, uri = %pending.info.uri, "Aborting request");
                pending.token.cancel();
                self.network = None;
                self.stats.media_requests_aborted += 1;
                if pending.info.timestamp_offset.is_some() {
                    self.clear_pending_timeline();
                }
            }
            Phase::Waiting(mut pending, stage) => {
                // Past the network stage: processing and append complete normally.
                pending.aborted = true;
                self.phase = Phase::Waiting(pending, stage);
            }
            Phase::WaitingOnTimeline(mut pending, processed) => {
                pending.aborted = true;
                self.phase = Phase::WaitingOnTimeline(pending, processed);
            }
            phase => self.phase = phase,
        }
        if matches!(self.phase, Phase::Ready) && !self.paused() {
            self.monitor_buffer();
        }
    }

    fn on_network_complete(&mut self, result: Result<Fetched, RequestError>) {
        let Phase::Waiting(mut pending, WaitStage::Requesting) =
            std::mem::replace(&mut self.phase, Phase::Ready)
        else {
            warn!(loader = %self.kind, "Request finished without a pending segment");
            return;
        };

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(err) if err.is_aborted() => {
                self.stats.media_requests_aborted += 1;
                if pending.info.timestamp_offset.is_some() {
                    self.clear_pending_timeline();
                }
                if !self.paused() {
                    self.monitor_buffer();
                }
                return;
            }
            Err(err) => {
                self.stats.media_requests += 1;
                if err.is_timeout() {
                    self.stats.media_requests_timedout += 1;
                } else {
                    self.stats.media_requests_errored += 1;
                }
                self.stats.bandwidth = BANDWIDTH_SENTINEL;
                self.stats.round_trip = None;
                self.events.emit(LoaderEvent::BandwidthUpdate {
                    bandwidth: self.stats.bandwidth,
                    round_trip: None,
                });
                let error = LoaderError::from_request(&err, &pending.info.uri, pending.info.media_index);
                self.phase = Phase::Waiting(pending, WaitStage::Requesting);
                self.fail(error);
                return;
            }
        };

        let response = &fetched.segment;
        let bytes = response.bytes.len() as u64;
        let elapsed = response.elapsed.max(Duration::from_millis(1));
        self.stats.media_requests += 1;
        self.stats.media_bytes_transferred += bytes;
        self.stats.media_transfer_duration += response.elapsed;
        self.stats.bandwidth = (bytes as f64 * 8.0 / elapsed.as_secs_f64()).floor();
        self.stats.round_trip = Some(response.elapsed);
        pending.info.stats.bytes_received = bytes;
        pending.info.stats.round_trip = response.elapsed;
        self.events.emit(LoaderEvent::BandwidthUpdate {
            bandwidth: self.stats.bandwidth,
            round_trip: self.stats.round_trip,
        });
        trace!(loader = %self.kind, uri = %response.uri, bytes, ?elapsed, "Segment downloaded");

        let key = match self.key_material(&pending.info, fetched.key.map(|r| r.bytes)) {
            Ok(key) => key,
            Err(err) => {
                self.phase = Phase::Waiting(pending, WaitStage::Requesting);
                self.fail(err);
                return;
            }
        };

        let init = pending.info.map.as_ref().and_then(|map| {
            let id = map.id();
            if let Some(response) = &fetched.init {
                self.init_segments.insert(
                    id.clone(),
                    CachedInit {
                        bytes: response.bytes.clone(),
                        track_info: map.track_info,
                    },
                );
            }
            self.init_segments.get(&id).map(|cached| InitMaterial {
                id,
                bytes: cached.bytes.clone(),
                track_info: cached.track_info.or(map.track_info),
            })
        });

        let job = ProcessJob {
            uri: pending.info.uri.clone(),
            bytes: fetched.segment.bytes,
            key,
            init,
            timeline: pending.info.timeline,
            duration: pending.info.duration,
        };
        self.processing = Some(pipeline::process(self.deps.transmuxer.clone(), job));
        self.phase = Phase::Waiting(pending, WaitStage::Processing);
    }

    fn key_material(
        &self,
        info: &SegmentInfo,
        fetched: Option<Bytes>,
    ) -> Result<Option<KeyMaterial>, LoaderError> {
        let Some(descriptor) = &info.key else {
            return Ok(None);
        };
        let key = match fetched {
            Some(bytes) => {
                if bytes.len() != KEY_LENGTH {
                    return Err(LoaderError::new(
                        ErrorKind::Decrypt,
                        format!(
                            "Decryption key from {} has incorrect length: {} bytes (expected {KEY_LENGTH})",
                            descriptor.uri,
                            bytes.len()
                        ),
                    )
                    .with_uri(descriptor.uri.clone())
                    .with_media_index(info.media_index));
                }
                self.key_cache.insert(&descriptor.uri, bytes.clone());
                bytes
            }
            None => self.key_cache.get(&descriptor.uri).ok_or_else(|| {
                LoaderError::new(ErrorKind::Decrypt, format!("Key bytes unavailable for {}", descriptor.uri))
                    .with_uri(descriptor.uri.clone())
            })?,
        };
        let iv = segment_iv(descriptor, info.media_sequence)
            .map_err(|e| LoaderError::from(e).with_media_index(info.media_index))?;
        Ok(Some(KeyMaterial { key, iv }))
    }

    // ---- processing ----

    fn on_processed(&mut self, result: Result<Processed, LoaderError>) {
        let Phase::Waiting(pending, WaitStage::Processing) =
            std::mem::replace(&mut self.phase, Phase::Ready)
        else {
            warn!(loader = %self.kind, "Processing finished without a pending segment");
            return;
        };
        match result {
            Ok(processed) => self.handle_processed(pending, processed),
            Err(err) => {
                let err = err.with_media_index(pending.info.media_index);
                self.phase = Phase::Waiting(pending, WaitStage::Processing);
                self.fail(err);
            }
        }
    }

    fn primary_type(&self) -> MediaType {
        match self.kind {
            LoaderKind::Audio => MediaType::Audio,
            _ if self.media_info().is_some_and(|m| !m.has_video) => MediaType::Audio,
            _ => MediaType::Video,
        }
    }

    fn handle_processed(&mut self, mut pending: Box<PendingSegment>, processed: Processed) {
        if let (Some(probed), Some((id, _))) = (processed.probed, &processed.init) {
            if let Some(cached) = self.init_segments.get_mut(id) {
                cached.track_info = Some(probed);
            }
            if let Some(segment) = pending.info.segment.resolve_mut(self.playlist.as_mut())
                && let Some(map) = &mut segment.map
            {
                map.track_info = Some(probed);
            }
        }

        let init_track_info = processed.init.as_ref().and_then(|(id, _)| {
            self.init_segments.get(id).and_then(|cached| cached.track_info)
        });
        if let Some(track_info) = processed.transmuxed.track_info.or(init_track_info) {
            if let Some(message) = illegal_media_switch(self.kind, self.starting_media.as_ref(), &track_info) {
                let err = LoaderError::new(ErrorKind::IllegalMediaSwitch, message)
                    .with_uri(pending.info.uri.clone())
                    .with_media_index(pending.info.media_index)
                    .excluding_playlist();
                self.phase = Phase::Waiting(pending, WaitStage::Processing);
                self.fail(err);
                return;
            }
            self.current_media = Some(track_info);
            self.starting_media.get_or_insert(track_info);
        }

        if self.kind == LoaderKind::Subtitle {
            self.handle_cues(pending, Box::new(processed));
            return;
        }

        self.apply_timing(&mut pending, &processed);

        if pending.info.is_sync_request && !self.sync_request_confirmed(&pending.info) {
            debug!(
                loader = %self.kind,
                media_index = pending.info.media_index,
                "Sync segment did not cover the target time, not appending"
            );
            if pending.info.timestamp_offset.is_some() {
                self.clear_pending_timeline();
            }
            self.phase = Phase::Ready;
            if !self.paused() {
                self.monitor_buffer();
            }
            return;
        }

        let offset = self
            .deps
            .source_updater
            .timestamp_offset(self.primary_type())
            .unwrap_or(0.0);
        if !processed.transmuxed.captions.is_empty() {
            let cues = processed
                .transmuxed
                .captions
                .iter()
                .map(|cue| cue.shifted(offset))
                .collect();
            self.events.emit(LoaderEvent::Captions(cues));
        }
        if !processed.transmuxed.metadata.is_empty() {
            let mut frames = processed.transmuxed.metadata.clone();
            for frame in &mut frames {
                frame.time += offset;
            }
            self.events.emit(LoaderEvent::Metadata(frames));
        }

        if self.must_wait_for_timeline(pending.info.timeline) {
            debug!(
                loader = %self.kind,
                timeline = pending.info.timeline,
                "Waiting for timeline change before appending"
            );
            self.phase = Phase::Waiting(pending, WaitStage::Gated(Box::new(processed)));
            return;
        }

        self.append(pending, processed);
    }

    /// Rollover correction, timestamp offset update and learned timing.
    fn apply_timing(&mut self, pending: &mut PendingSegment, processed: &Processed) {
        let info = &mut pending.info;
        let Some((raw_start, raw_end)) = processed.transmuxed.primary_timing() else {
            let start = info.start_of_segment;
            info.timing = Some((start, start + info.duration));
            return;
        };

        let (media_start, media_end) = self.rollover.adjust(info.timeline, raw_start, raw_end);
        info.media_span = Some((media_start, media_end));

        if let Some(intended_start) = info.timestamp_offset {
            self.update_timestamp_offset(intended_start - media_start);
        }

        let offset = self
            .deps
            .source_updater
            .timestamp_offset(self.primary_type())
            .unwrap_or(0.0);
        let (start, end) = (media_start + offset, media_end + offset);
        info.timing = Some((start, end));
        trace!(loader = %self.kind, media_index = info.media_index, start, end, "Segment timing learned");

        let part_index = info.part_index;
        if let Some(segment) = info.segment.resolve_mut(self.playlist.as_mut()) {
            match part_index.and_then(|i| segment.parts.get_mut(i)) {
                Some(part) => {
                    part.start = Some(start);
                    part.end = Some(end);
                    if part_index == Some(0) {
                        segment.start = Some(start);
                    }
                }
                None => {
                    segment.start = Some(start);
                    segment.end = Some(end);
                }
            }
        }

        let playlist_uri = self.playlist.as_ref().map(|p| p.uri.clone()).unwrap_or_default();
        self.deps.sync.save_segment_timing(&SegmentTiming {
            playlist_uri,
            media_sequence: info.media_sequence,
            timeline: info.timeline,
            media_start,
            start,
            end,
            discontinuity_start: info.discontinuity_start,
        });
    }

    fn update_timestamp_offset(&mut self, offset: f64) {
        let updater = self.deps.source_updater.clone();
        let media = self.media_info().unwrap_or(TrackInfo::audio_video());
        let mut types = Vec::new();
        match self.kind {
            LoaderKind::Main => {
                if media.has_video {
                    types.push(MediaType::Video);
                }
                if media.has_audio && !self.audio_disabled {
                    types.push(MediaType::Audio);
                }
            }
            LoaderKind::Audio => types.push(MediaType::Audio),
            LoaderKind::Subtitle => {}
        }
        for media_type in types {
            if !updater.has_buffer(media_type) || updater.timestamp_offset(media_type) == Some(offset) {
                continue;
            }
            debug!(loader = %self.kind, media_type = %media_type, offset, "Setting timestamp offset");
            updater.set_timestamp_offset(media_type, offset);
            self.events.emit(LoaderEvent::TimestampOffset { media_type, offset });
        }
    }

    /// Re-run selection with the timing just learned; the probe is only kept
    /// when it lands on the same position.
    fn sync_request_confirmed(&mut self, info: &SegmentInfo) -> bool {
        self.events.emit(LoaderEvent::SyncInfoUpdate);
        let Some(playlist) = &self.playlist else {
            return false;
        };
        let playback = &self.deps.playback;
        let current_time = playback.current_time();
        self.sync_point = self.deps.sync.sync_point(
            playlist,
            playback.duration(),
            Some(info.timeline),
            current_time,
        );
        if self.sync_point.is_none() {
            return true;
        }
        let buffered = self.buffered();
        let next = choose_next_request(&SelectionContext {
            playlist,
            buffered: &buffered,
            current_time,
            has_played: playback.has_played(),
            seeking: playback.seeking(),
            media_source_ended: playback.ended(),
            goal_buffer_length: self.config.goal_buffer_length,
            media_index: None,
            part_index: None,
            sync_point: self.sync_point,
            current_timeline: Some(info.timeline),
            fetch_at_buffer: self.fetch_at_buffer,
            main_independent_segments: self.main_independent_segments,
        });
        let confirmed = match (next, &info.segment) {
            (Some(next), SegmentRef::Active(index)) => {
                next.media_index == *index && next.part_index == info.part_index
            }
            _ => false,
        };
        if !confirmed {
            self.media_index = None;
            self.part_index = None;
        }
        confirmed
    }

    fn retry_gated(&mut self) {
        let Phase::Waiting(pending, WaitStage::Gated(processed)) =
            std::mem::replace(&mut self.phase, Phase::Ready)
        else {
            return;
        };
        if self.must_wait_for_timeline(pending.info.timeline) {
            self.phase = Phase::Waiting(pending, WaitStage::Gated(processed));
            return;
        }
        self.append(pending, *processed);
    }

    // ---- subtitles ----

    fn handle_cues(&mut self, mut pending: Box<PendingSegment>, processed: Box<Processed>) {
        let timeline = pending.info.timeline;
        let mapping = self.deps.sync.mapping_for_timeline(timeline);
        let (Some(mapping), false) = (mapping, self.must_wait_for_timeline(timeline)) else {
            trace!(loader = %self.kind, timeline, "Waiting on timeline mapping for cues");
            self.phase = Phase::WaitingOnTimeline(pending, processed);
            return;
        };
        let Some(track) = self.text_track.clone() else {
            self.phase = Phase::WaitingOnTimeline(pending, processed);
            return;
        };

        let cues: Vec<Cue> = processed
            .transmuxed
            .captions
            .iter()
            .map(|cue| cue.shifted(mapping))
            .collect();
        let info = &mut pending.info;
        let start = cues.iter().map(|c| c.start).reduce(f64::min).unwrap_or(info.start_of_segment);
        let end = cues
            .iter()
            .map(|c| c.end)
            .reduce(f64::max)
            .unwrap_or(start + info.duration);
        info.timing = Some((start, end));
        if let Some(segment) = info.segment.resolve_mut(self.playlist.as_mut()) {
            segment.start = Some(start);
            segment.end = Some(end);
        }

        self.events.emit(LoaderEvent::Appending {
            media_index: info.media_index,
            part_index: info.part_index,
        });
        debug!(loader = %self.kind, media_index = info.media_index, cues = cues.len(), "Adding cues");
        track.add_cues(cues);
        self.on_append_success(pending, processed.transmuxed.byte_len());
    }

    fn retry_waiting_on_timeline(&mut self) {
        let Phase::WaitingOnTimeline(pending, processed) =
            std::mem::replace(&mut self.phase, Phase::Ready)
        else {
            return;
        };
        self.handle_cues(pending, processed);
    }

    // ---- appending ----

    fn append(&mut self, pending: Box<PendingSegment>, processed: Processed) {
        let span = pending.info.media_span;
        let mut payloads = Vec::new();
        let managed = self.managed_types();
        for (media_type, bytes) in processed.transmuxed.data_by_type() {
            if !managed.contains(&media_type) {
                trace!(loader = %self.kind, media_type = %media_type, "Skipping data for unmanaged type");
                continue;
            }
            let bytes = match &processed.init {
                Some((id, init)) if self.appended_init.get(&media_type) != Some(id) => {
                    self.appended_init.insert(media_type, id.clone());
                    let mut combined = BytesMut::with_capacity(init.len() + bytes.len());
                    combined.extend_from_slice(init);
                    combined.extend_from_slice(&bytes);
                    combined.freeze()
                }
                _ => bytes,
            };
            let mut payload = AppendPayload::new(bytes);
            payload.span = span;
            payloads.push((media_type, payload));
        }

        self.events.emit(LoaderEvent::Appending {
            media_index: pending.info.media_index,
            part_index: pending.info.part_index,
        });
        debug!(
            loader = %self.kind,
            media_index = pending.info.media_index,
            part_index = ?pending.info.part_index,
            buffers = payloads.len(),
            "Appending segment"
        );
        self.appending = Some(enqueue_appends(&self.deps.source_updater, payloads));
        self.phase = Phase::Appending(pending, AppendStage::Appending { retried: false });
    }

    fn on_append_complete(&mut self, outcomes: Vec<AppendOutcome>) {
        let Phase::Appending(pending, AppendStage::Appending { retried }) =
            std::mem::replace(&mut self.phase, Phase::Ready)
        else {
            warn!(loader = %self.kind, "Append finished without a pending segment");
            return;
        };

        let bytes: usize = outcomes.iter().map(|o| o.payload.len()).sum();
        let failed: Vec<AppendOutcome> = outcomes.into_iter().filter(|o| o.result.is_err()).collect();
        if failed.is_empty() {
            self.on_append_success(pending, bytes);
            return;
        }

        if failed.iter().all(|o| o.result == Err(BufferError::Aborted)) {
            debug!(loader = %self.kind, media_index = pending.info.media_index, "Append aborted");
            if !self.shared.disposed.load(Ordering::SeqCst) && !self.paused() {
                self.monitor_buffer();
            }
            return;
        }

        let non_quota = failed
            .iter()
            .find(|o| !matches!(o.result, Err(BufferError::QuotaExceeded)));
        if let Some(outcome) = non_quota {
            let reason = outcome
                .result
                .as_ref()
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default();
            let err = LoaderError::new(
                ErrorKind::Append,
                format!(
                    "Append of {} bytes to the {} buffer failed: {reason}",
                    outcome.payload.len(),
                    outcome.media_type
                ),
            )
            .with_uri(pending.info.uri.clone())
            .with_bytes(outcome.payload.len())
            .with_media_index(pending.info.media_index);
            self.events.emit(LoaderEvent::AppendError(err.clone()));
            self.phase = Phase::Appending(pending, AppendStage::Appending { retried });
            self.fail(err);
            return;
        }

        let retry: Vec<(MediaType, AppendPayload)> = failed
            .into_iter()
            .map(|o| (o.media_type, o.payload))
            .collect();
        if retried {
            let err = self.quota_error(&pending, &retry, "Quota exceeded again after freeing buffer space");
            self.phase = Phase::Appending(pending, AppendStage::Appending { retried });
            self.fail(err);
            return;
        }
        self.start_quota_recovery(pending, retry);
    }

    fn quota_error(
        &self,
        pending: &PendingSegment,
        payloads: &[(MediaType, AppendPayload)],
        message: &str,
    ) -> LoaderError {
        let bytes = payloads.iter().map(|(_, p)| p.len()).sum();
        LoaderError::new(ErrorKind::QuotaExceeded, message)
            .with_uri(pending.info.uri.clone())
            .with_bytes(bytes)
            .with_media_index(pending.info.media_index)
            .excluding_playlist()
    }

    fn start_quota_recovery(
        &mut self,
        pending: Box<PendingSegment>,
        retry: Vec<(MediaType, AppendPayload)>,
    ) {
        let updater = &self.deps.source_updater;
        let extent = |ranges: TimeRanges| match (ranges.first_start(), ranges.last_end()) {
            (Some(start), Some(end)) => end - start,
            _ => 0.0,
        };
        let min_back_buffer = self.config.quota_back_buffer;
        if extent(updater.audio_buffered()) <= min_back_buffer
            && extent(updater.video_buffered()) <= min_back_buffer
        {
            let err = self.quota_error(
                &pending,
                &retry,
                "Quota exceeded error with append of a single segment of content",
            );
            self.phase = Phase::Appending(pending, AppendStage::Appending { retried: false });
            self.fail(err);
            return;
        }

        let playback = &self.deps.playback;
        let remove_start = playback.seekable().first_start().unwrap_or(0.0).max(0.0);
        let remove_end = playback.current_time() - min_back_buffer;
        warn!(
            loader = %self.kind,
            media_index = pending.info.media_index,
            remove_start,
            remove_end,
            "Quota exceeded, freeing buffer space before retrying append"
        );
        self.freeing = Some(self.remove(remove_start, remove_end));
        self.phase = Phase::Appending(pending, AppendStage::FreeingSpace { retry });
    }

    fn on_space_freed(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Appending(pending, AppendStage::FreeingSpace { retry }) => {
                debug!(loader = %self.kind, delay = ?self.config.quota_retry_delay, "Buffer space freed, retrying append shortly");
                self.quota_retry_at = Some(Instant::now() + self.config.quota_retry_delay);
                self.phase = Phase::Appending(pending, AppendStage::RetryDelay { retry });
            }
            phase => self.phase = phase,
        }
    }

    fn retry_quota_append(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Appending(pending, AppendStage::RetryDelay { retry }) => {
                debug!(loader = %self.kind, media_index = pending.info.media_index, "Retrying append after quota error");
                self.appending = Some(enqueue_appends(&self.deps.source_updater, retry));
                self.phase = Phase::Appending(pending, AppendStage::Appending { retried: true });
            }
            phase => self.phase = phase,
        }
    }

    fn on_append_success(&mut self, pending: Box<PendingSegment>, bytes: usize) {
        let PendingSegment { info, aborted, .. } = *pending;

        self.stats.media_appends += 1;
        self.stats.media_seconds_loaded += info.seconds();
        if let Some(requested_at) = info.stats.requested_at {
            let processing = requested_at.elapsed().max(Duration::from_millis(1));
            let rate = (info.stats.bytes_received as f64 * 8.0 / processing.as_secs_f64()).floor();
            self.stats.throughput_samples += 1;
            self.stats.throughput += (rate - self.stats.throughput) / self.stats.throughput_samples as f64;
        }

        if let Some(role) = self.kind.timeline_role() {
            let role_pending = self.deps.timelines.pending(role).is_some();
            if self.current_timeline != Some(info.timeline) || role_pending {
                let change = TimelineChange {
                    role,
                    from: self.current_timeline,
                    to: info.timeline,
                };
                self.deps.timelines.set_last(change);
                if self.kind == LoaderKind::Main
                    && !self.audio_disabled
                    && self.media_info().is_some_and(|m| m.has_audio)
                {
                    self.deps.timelines.set_last(TimelineChange {
                        role: crate::timeline::TimelineRole::Audio,
                        ..change
                    });
                }
            }
        }
        if self.current_timeline != Some(info.timeline) {
            info!(loader = %self.kind, from = ?self.current_timeline, to = info.timeline, "Timeline changed");
        }
        self.current_timeline = Some(info.timeline);
        self.fetch_at_buffer = true;
        self.force_timestamp_offset = false;
        self.events.emit(LoaderEvent::SyncInfoUpdate);

        match &info.segment {
            SegmentRef::Active(index) => {
                self.media_index = Some(*index);
                self.part_index = info.part_index;
            }
            SegmentRef::Detached(_) => {
                self.media_index = None;
                self.part_index = None;
            }
        }

        debug!(
            loader = %self.kind,
            media_index = info.media_index,
            part_index = ?info.part_index,
            timing = ?info.timing,
            bytes,
            "Segment appended"
        );
        self.events.emit(LoaderEvent::Appended {
            media_index: info.media_index,
            part_index: info.part_index,
            bytes,
        });
        if !aborted {
            self.events.emit(LoaderEvent::AppendsDone);
        }

        if self.is_end_of_stream() && !self.ended_emitted {
            info!(loader = %self.kind, "Final segment appended");
            self.ended_emitted = true;
            self.events.emit(LoaderEvent::Ended);
        }

        self.phase = Phase::Ready;
        if !self.paused() {
            self.monitor_buffer();
        }
    }

    fn is_end_of_stream(&self) -> bool {
        let (Some(playlist), Some(index)) = (&self.playlist, self.media_index) else {
            return false;
        };
        let Some(segment) = playlist.segments.get(index) else {
            return false;
        };
        let last_part = !segment.has_parts()
            || self.part_index.is_some_and(|part| part + 1 == segment.parts.len());
        playlist.end_list && index + 1 == playlist.segments.len() && last_part
    }
}
