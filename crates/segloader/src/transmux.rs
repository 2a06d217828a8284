//! # Transmuxer seam
//!
//! Segment bytes are pushed to a transmuxer which answers with a stream of
//! messages ending in [`TransmuxMessage::Done`]. Timing is reported in 90 kHz
//! clock ticks exactly as found in the stream, before rollover correction.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::buffer::MediaType;
use crate::error::TransmuxError;
use crate::text_track::Cue;

/// Ticks per second of MPEG-TS timestamps.
pub const ONE_SECOND_IN_TS: u64 = 90_000;

/// Media types carried by a rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackInfo {
    pub has_audio: bool,
    pub has_video: bool,
    /// Audio and video arrive interleaved in one stream.
    #[serde(default)]
    pub is_muxed: bool,
}

impl TrackInfo {
    pub fn audio_video() -> Self {
        Self {
            has_audio: true,
            has_video: true,
            is_muxed: true,
        }
    }

    pub fn video_only() -> Self {
        Self {
            has_video: true,
            ..Self::default()
        }
    }

    pub fn audio_only() -> Self {
        Self {
            has_audio: true,
            ..Self::default()
        }
    }
}

/// ID3 or similar timed metadata found in a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedMetadata {
    /// Media time in seconds.
    pub time: f64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransmuxMessage {
    TrackInfo(TrackInfo),
    /// Raw start/end of the content of one type, in 90 kHz ticks.
    TimingInfo {
        media_type: MediaType,
        start: u64,
        end: u64,
    },
    Data {
        media_type: MediaType,
        bytes: Bytes,
    },
    Captions(Vec<Cue>),
    Metadata(Vec<TimedMetadata>),
    Error(String),
    Done,
}

/// Work handed to a transmuxer for one segment or part.
#[derive(Debug, Clone)]
pub struct TransmuxJob {
    pub bytes: Bytes,
    /// Track info learned from the init segment, when there is one.
    pub init: Option<TrackInfo>,
    pub timeline: u64,
    pub duration: f64,
}

#[async_trait]
pub trait Transmuxer: Send + Sync {
    /// Start transmuxing; results arrive on the returned channel.
    fn push(&self, job: TransmuxJob) -> mpsc::Receiver<TransmuxMessage>;

    /// Inspect an init segment for the tracks it declares.
    async fn probe_init_segment(&self, bytes: Bytes) -> Result<TrackInfo, TransmuxError>;
}

/// Everything a transmuxer reported for one segment.
#[derive(Debug, Clone, Default)]
pub struct TransmuxedSegment {
    pub track_info: Option<TrackInfo>,
    pub timing: HashMap<MediaType, (u64, u64)>,
    pub data: Vec<(MediaType, Bytes)>,
    pub captions: Vec<Cue>,
    pub metadata: Vec<TimedMetadata>,
}

impl TransmuxedSegment {
    /// Raw timing used for the segment as a whole, video first.
    pub fn primary_timing(&self) -> Option<(u64, u64)> {
        self.timing
            .get(&MediaType::Video)
            .or_else(|| self.timing.get(&MediaType::Audio))
            .copied()
    }

    pub fn byte_len(&self) -> usize {
        self.data.iter().map(|(_, b)| b.len()).sum()
    }

    /// Concatenated data per media type, in arrival order.
    pub fn data_by_type(&self) -> Vec<(MediaType, Bytes)> {
        let mut merged: Vec<(MediaType, Vec<u8>)> = Vec::new();
        for (media_type, bytes) in &self.data {
            match merged.iter_mut().find(|(t, _)| t == media_type) {
                Some((_, buffer)) => buffer.extend_from_slice(bytes),
                None => merged.push((*media_type, bytes.to_vec())),
            }
        }
        merged
            .into_iter()
            .map(|(t, b)| (t, Bytes::from(b)))
            .collect()
    }
}

/// Drain a transmuxer channel until `Done`.
pub async fn collect(mut rx: mpsc::Receiver<TransmuxMessage>) -> Result<TransmuxedSegment, TransmuxError> {
    let mut segment = TransmuxedSegment::default();
    while let Some(message) = rx.recv().await {
        match message {
            TransmuxMessage::TrackInfo(info) => segment.track_info = Some(info),
            TransmuxMessage::TimingInfo {
                media_type,
                start,
                end,
            } => {
                segment.timing.insert(media_type, (start, end));
            }
            TransmuxMessage::Data { media_type, bytes } => segment.data.push((media_type, bytes)),
            TransmuxMessage::Captions(cues) => segment.captions.extend(cues),
            TransmuxMessage::Metadata(frames) => segment.metadata.extend(frames),
            TransmuxMessage::Error(message) => return Err(TransmuxError::Failed(message)),
            TransmuxMessage::Done => return Ok(segment),
        }
    }
    Err(TransmuxError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_until_done() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(TransmuxMessage::TrackInfo(TrackInfo::audio_video())).await.unwrap();
        tx.send(TransmuxMessage::TimingInfo {
            media_type: MediaType::Audio,
            start: 90_000,
            end: 180_000,
        })
        .await
        .unwrap();
        tx.send(TransmuxMessage::Data {
            media_type: MediaType::Video,
            bytes: Bytes::from_static(b"ab"),
        })
        .await
        .unwrap();
        tx.send(TransmuxMessage::Data {
            media_type: MediaType::Video,
            bytes: Bytes::from_static(b"cd"),
        })
        .await
        .unwrap();
        tx.send(TransmuxMessage::Done).await.unwrap();

        let segment = collect(rx).await.unwrap();
        assert_eq!(segment.primary_timing(), Some((90_000, 180_000)));
        assert_eq!(segment.byte_len(), 4);
        assert_eq!(
            segment.data_by_type(),
            vec![(MediaType::Video, Bytes::from_static(b"abcd"))]
        );
    }

    #[tokio::test]
    async fn test_collect_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        assert_eq!(collect(rx).await.unwrap_err(), TransmuxError::Closed);
    }
}
