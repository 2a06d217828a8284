use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use segloader::{MediaBuffer, Playback, Playlist, TimeRanges};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Gaps smaller than this are skipped instead of stalling.
const MAX_GAP_JUMP: f64 = 0.5;
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct ClockState {
    time: f64,
    duration: f64,
    end_list: bool,
    has_played: bool,
    stalled: bool,
}

/// Playhead that advances through buffered media at a fixed speed and stalls
/// when it reaches the end of the buffer.
pub struct SimulatedPlayback {
    buffer: Arc<dyn MediaBuffer>,
    state: Mutex<ClockState>,
}

impl SimulatedPlayback {
    pub fn new(buffer: Arc<dyn MediaBuffer>) -> Self {
        Self {
            buffer,
            state: Mutex::new(ClockState {
                time: 0.0,
                duration: f64::INFINITY,
                end_list: false,
                has_played: false,
                stalled: false,
            }),
        }
    }

    /// Live playlists keep an unbounded duration until they end.
    pub fn set_playlist(&self, playlist: &Playlist) {
        let mut state = self.state.lock();
        state.end_list = playlist.end_list;
        state.duration = if playlist.end_list {
            playlist.duration()
        } else {
            f64::INFINITY
        };
    }

    /// Advances the playhead by `elapsed` seconds of media time.
    pub fn advance(&self, elapsed: f64) {
        let buffered = self.buffer.buffered();
        let mut state = self.state.lock();

        if !state.has_played {
            let Some(first) = buffered.first_start() else {
                return;
            };
            state.time = state.time.max(first);
            state.has_played = true;
            debug!(time = state.time, "Playback started");
        }

        let time = state.time;
        let range = buffered
            .iter()
            .find(|&(start, end)| end > time && start - time <= MAX_GAP_JUMP);
        match range {
            Some((start, end)) => {
                if state.stalled {
                    debug!(time = state.time, "Playback resumed");
                    state.stalled = false;
                }
                state.time = (state.time.max(start) + elapsed).min(end).min(state.duration);
            }
            None if !state.stalled => {
                debug!(time = state.time, "Playback stalled waiting for data");
                state.stalled = true;
            }
            None => {}
        }
        trace!(time = state.time, "Clock tick");
    }

    /// Ticks the clock in the background at `speed` times real time.
    pub fn spawn(self: &Arc<Self>, speed: f64) -> JoinHandle<()> {
        let clock = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                clock.advance(TICK.as_secs_f64() * speed);
            }
        })
    }
}

impl Playback for SimulatedPlayback {
    fn current_time(&self) -> f64 {
        self.state.lock().time
    }

    fn duration(&self) -> f64 {
        self.state.lock().duration
    }

    fn seekable(&self) -> TimeRanges {
        let state = self.state.lock();
        if state.end_list {
            return TimeRanges::single(0.0, state.duration);
        }
        let buffered = self.buffer.buffered();
        match (buffered.first_start(), buffered.last_end()) {
            (Some(start), Some(end)) => TimeRanges::single(start, end),
            _ => TimeRanges::new(),
        }
    }

    fn seeking(&self) -> bool {
        false
    }

    fn has_played(&self) -> bool {
        self.state.lock().has_played
    }

    fn ended(&self) -> bool {
        let state = self.state.lock();
        state.end_list && state.time >= state.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use segloader::testing::MemoryMediaBuffer;
    use segloader::{AppendPayload, Segment};

    async fn buffer_with(spans: &[(f64, f64)]) -> Arc<MemoryMediaBuffer> {
        let buffer = Arc::new(MemoryMediaBuffer::new());
        for &(start, end) in spans {
            buffer
                .append(AppendPayload::new(Bytes::from_static(b"x")).with_span(start, end))
                .await
                .unwrap();
        }
        buffer
    }

    #[tokio::test]
    async fn test_clock_waits_for_data_then_plays_to_buffer_end() {
        let buffer = buffer_with(&[]).await;
        let clock = SimulatedPlayback::new(buffer.clone());
        clock.advance(1.0);
        assert!(!clock.has_played());

        buffer
            .append(AppendPayload::new(Bytes::from_static(b"x")).with_span(2.0, 4.0))
            .await
            .unwrap();
        clock.advance(1.0);
        assert!(clock.has_played());
        assert_eq!(clock.current_time(), 3.0);

        clock.advance(5.0);
        assert_eq!(clock.current_time(), 4.0);
    }

    #[tokio::test]
    async fn test_clock_jumps_small_gaps_only() {
        let buffer = buffer_with(&[(0.0, 2.0), (2.3, 4.0), (6.0, 8.0)]).await;
        let clock = SimulatedPlayback::new(buffer);
        clock.advance(2.0);
        assert_eq!(clock.current_time(), 2.0);
        clock.advance(1.0);
        assert!((clock.current_time() - 3.3).abs() < 1e-9);
        clock.advance(5.0);
        clock.advance(5.0);
        assert_eq!(clock.current_time(), 4.0);
    }

    #[tokio::test]
    async fn test_vod_clock_ends_at_duration() {
        let buffer = buffer_with(&[(0.0, 10.0)]).await;
        let clock = SimulatedPlayback::new(buffer);
        let mut playlist = Playlist::new("vod.m3u8", 5.0, vec![Segment::new("a.ts", 5.0)]);
        playlist.end_list = true;
        clock.set_playlist(&playlist);

        assert_eq!(clock.seekable().iter().collect::<Vec<_>>(), vec![(0.0, 5.0)]);
        clock.advance(20.0);
        assert_eq!(clock.current_time(), 5.0);
        assert!(clock.ended());
    }
}
