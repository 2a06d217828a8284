//! Timing probe for MPEG-TS segments.
//!
//! Nothing is remuxed: the segment bytes pass through unchanged and only the
//! PES timestamps are read so the loader can place the segment on its timeline.

use async_trait::async_trait;
use bytes::Bytes;
use segloader::{MediaType, TrackInfo, TransmuxError, TransmuxJob, TransmuxMessage, Transmuxer};
use tokio::sync::mpsc;
use tracing::trace;

const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const TICKS_PER_SECOND: f64 = 90_000.0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TsTimestamps {
    /// First PTS seen on a video PES.
    pub video: Option<u64>,
    /// First PTS seen on an audio PES.
    pub audio: Option<u64>,
}

impl TsTimestamps {
    fn track_info(&self) -> Option<TrackInfo> {
        match (self.audio.is_some(), self.video.is_some()) {
            (true, true) => Some(TrackInfo::audio_video()),
            (false, true) => Some(TrackInfo::video_only()),
            (true, false) => Some(TrackInfo::audio_only()),
            (false, false) => None,
        }
    }
}

fn read_pts(bytes: &[u8]) -> u64 {
    (((bytes[0] >> 1) & 0x07) as u64) << 30
        | (bytes[1] as u64) << 22
        | ((bytes[2] >> 1) as u64) << 15
        | (bytes[3] as u64) << 7
        | (bytes[4] >> 1) as u64
}

/// Payload of one TS packet, skipping any adaptation field.
fn packet_payload(packet: &[u8]) -> Option<&[u8]> {
    let adaptation_field_control = (packet[3] >> 4) & 0x03;
    let mut offset = 4;
    if adaptation_field_control == 0x02 || adaptation_field_control == 0x03 {
        offset += 1 + packet[4] as usize;
    }
    if (adaptation_field_control == 0x01 || adaptation_field_control == 0x03)
        && offset < packet.len()
    {
        Some(&packet[offset..])
    } else {
        None
    }
}

/// Scans the PES headers that start in `data` for the first audio and
/// video presentation timestamps.
pub fn scan_timestamps(data: &[u8]) -> Result<TsTimestamps, TransmuxError> {
    if data.first() != Some(&SYNC_BYTE) {
        return Err(TransmuxError::Failed(
            "segment is not an MPEG-TS stream".to_string(),
        ));
    }

    let mut found = TsTimestamps::default();
    for packet in data.chunks_exact(TS_PACKET_SIZE) {
        if packet[0] != SYNC_BYTE {
            return Err(TransmuxError::Failed(format!(
                "invalid sync byte 0x{:02x}",
                packet[0]
            )));
        }
        let payload_unit_start = packet[1] & 0x40 != 0;
        if !payload_unit_start {
            continue;
        }
        let Some(pes) = packet_payload(packet) else {
            continue;
        };
        if pes.len() < 14 || pes[..3] != [0x00, 0x00, 0x01] {
            continue;
        }
        let stream_id = pes[3];
        let has_pts = pes[7] & 0x80 != 0;
        if !has_pts {
            continue;
        }
        let pts = read_pts(&pes[9..14]);
        match stream_id {
            0xE0..=0xEF if found.video.is_none() => found.video = Some(pts),
            0xC0..=0xDF | 0xBD if found.audio.is_none() => found.audio = Some(pts),
            _ => {}
        }
        if found.video.is_some() && found.audio.is_some() {
            break;
        }
    }
    Ok(found)
}

fn probe_messages(job: &TransmuxJob) -> Vec<TransmuxMessage> {
    let timestamps = match scan_timestamps(&job.bytes) {
        Ok(timestamps) => timestamps,
        Err(e) => return vec![TransmuxMessage::Error(e.to_string())],
    };
    let Some(track_info) = timestamps.track_info() else {
        return vec![TransmuxMessage::Error(
            "no timestamped PES packets in segment".to_string(),
        )];
    };
    let span = (job.duration * TICKS_PER_SECOND).round() as u64;
    trace!(?timestamps, span, "Probed segment timestamps");

    let mut messages = vec![TransmuxMessage::TrackInfo(track_info)];
    if let Some(start) = timestamps.video {
        messages.push(TransmuxMessage::TimingInfo {
            media_type: MediaType::Video,
            start,
            end: start + span,
        });
    }
    if let Some(start) = timestamps.audio {
        messages.push(TransmuxMessage::TimingInfo {
            media_type: MediaType::Audio,
            start,
            end: start + span,
        });
    }
    // Muxed bytes go to a single buffer so they are written once.
    let primary = if track_info.has_video {
        MediaType::Video
    } else {
        MediaType::Audio
    };
    messages.push(TransmuxMessage::Data {
        media_type: primary,
        bytes: job.bytes.clone(),
    });
    messages.push(TransmuxMessage::Done);
    messages
}

/// [`Transmuxer`] that forwards TS segments untouched after reading their timing.
#[derive(Debug, Default)]
pub struct TsProbe;

#[async_trait]
impl Transmuxer for TsProbe {
    fn push(&self, job: TransmuxJob) -> mpsc::Receiver<TransmuxMessage> {
        let messages = probe_messages(&job);
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for message in messages {
            // Capacity covers every message.
            let _ = tx.try_send(message);
        }
        rx
    }

    async fn probe_init_segment(&self, _bytes: Bytes) -> Result<TrackInfo, TransmuxError> {
        Err(TransmuxError::Probe(
            "initialization segments are not supported for MPEG-TS".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts_bytes(pts: u64) -> [u8; 5] {
        [
            0x21 | (((pts >> 30) & 0x07) as u8) << 1,
            (pts >> 22) as u8,
            (((pts >> 15) & 0x7F) as u8) << 1 | 1,
            (pts >> 7) as u8,
            ((pts & 0x7F) as u8) << 1 | 1,
        ]
    }

    fn pes_packet(pid: u16, stream_id: u8, pts: u64) -> Vec<u8> {
        let mut packet = vec![SYNC_BYTE, 0x40 | (pid >> 8) as u8, pid as u8, 0x10];
        packet.extend_from_slice(&[0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80, 0x80, 0x05]);
        packet.extend_from_slice(&pts_bytes(pts));
        packet.resize(TS_PACKET_SIZE, 0xFF);
        packet
    }

    fn segment(packets: &[Vec<u8>]) -> Bytes {
        Bytes::from(packets.concat())
    }

    fn job(bytes: Bytes, duration: f64) -> TransmuxJob {
        TransmuxJob {
            bytes,
            init: None,
            timeline: 0,
            duration,
        }
    }

    #[test]
    fn test_scan_finds_first_audio_and_video_pts() {
        let data = segment(&[
            pes_packet(0x100, 0xE0, 900_000),
            pes_packet(0x101, 0xC0, 899_000),
            pes_packet(0x100, 0xE0, 903_003),
        ]);
        let timestamps = scan_timestamps(&data).unwrap();
        assert_eq!(timestamps.video, Some(900_000));
        assert_eq!(timestamps.audio, Some(899_000));
    }

    #[test]
    fn test_pts_above_32_bits_survives() {
        let pts = (1u64 << 33) - 90_000;
        let data = segment(&[pes_packet(0x100, 0xE0, pts)]);
        assert_eq!(scan_timestamps(&data).unwrap().video, Some(pts));
    }

    #[test]
    fn test_non_ts_input_is_rejected() {
        assert!(scan_timestamps(b"not a transport stream").is_err());
    }

    #[tokio::test]
    async fn test_push_emits_timing_then_single_data_message() {
        let data = segment(&[
            pes_packet(0x100, 0xE0, 180_000),
            pes_packet(0x101, 0xC0, 180_000),
        ]);
        let mut rx = TsProbe.push(job(data.clone(), 4.0));
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }

        assert_eq!(messages[0], TransmuxMessage::TrackInfo(TrackInfo::audio_video()));
        assert!(messages.contains(&TransmuxMessage::TimingInfo {
            media_type: MediaType::Video,
            start: 180_000,
            end: 540_000,
        }));
        let data_messages: Vec<_> = messages
            .iter()
            .filter(|m| matches!(m, TransmuxMessage::Data { .. }))
            .collect();
        assert_eq!(
            data_messages,
            vec![&TransmuxMessage::Data {
                media_type: MediaType::Video,
                bytes: data,
            }]
        );
        assert_eq!(messages.last(), Some(&TransmuxMessage::Done));
    }

    #[tokio::test]
    async fn test_push_without_timestamps_reports_error() {
        let mut packet = vec![SYNC_BYTE, 0x00, 0x11, 0x10];
        packet.resize(TS_PACKET_SIZE, 0xFF);
        let mut rx = TsProbe.push(job(Bytes::from(packet), 4.0));
        assert!(matches!(rx.recv().await, Some(TransmuxMessage::Error(_))));
    }
}
