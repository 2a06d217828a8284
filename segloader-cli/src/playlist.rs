use m3u8_rs::{KeyMethod, MediaPlaylist, parse_playlist_res};
use reqwest::Client;
use segloader::{ByteRange, InitSegment, KeyDescriptor, Playlist, Segment};
use tracing::{debug, warn};
use url::Url;

use crate::error::AppError;

/// Fetches a media playlist and converts it into the loader model.
pub async fn fetch_media_playlist(client: &Client, url: &Url) -> Result<Playlist, AppError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| AppError::Playlist(format!("Failed to fetch playlist {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::Playlist(format!(
            "Failed to fetch playlist {url}: HTTP {}",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| AppError::Playlist(format!("Failed to read playlist {url}: {e}")))?;
    parse_media_playlist(&bytes, url)
}

pub fn parse_media_playlist(bytes: &[u8], url: &Url) -> Result<Playlist, AppError> {
    match parse_playlist_res(bytes) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => convert(&media, url),
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(AppError::Playlist(format!(
            "Expected Media Playlist, got Master for {url}"
        ))),
        Err(e) => Err(AppError::Playlist(format!("Failed to parse playlist {url}: {e}"))),
    }
}

fn resolve(base: &Url, uri: &str) -> String {
    base.join(uri).map(|u| u.to_string()).unwrap_or_else(|e| {
        warn!("Failed to resolve URI '{}' against '{}': {}", uri, base, e);
        uri.to_string()
    })
}

/// Offsets omitted from `EXT-X-BYTERANGE` continue where the previous
/// sub-range of the same resource ended.
fn chain_range(
    range: &m3u8_rs::ByteRange,
    uri: &str,
    previous: &mut Option<(String, u64)>,
) -> ByteRange {
    let offset = match (range.offset, previous.as_ref()) {
        (Some(offset), _) => offset,
        (None, Some((last_uri, end))) if last_uri == uri => *end,
        (None, _) => 0,
    };
    *previous = Some((uri.to_string(), offset + range.length));
    ByteRange::new(offset, range.length)
}

/// Converts a parsed media playlist. Keys and maps stay in effect until the
/// next tag replaces them; every discontinuity starts a new timeline.
pub fn convert(media: &MediaPlaylist, url: &Url) -> Result<Playlist, AppError> {
    let mut key: Option<KeyDescriptor> = None;
    let mut map: Option<InitSegment> = None;
    let mut timeline = media.discontinuity_sequence;
    let mut segment_range: Option<(String, u64)> = None;
    let mut map_range: Option<(String, u64)> = None;

    let mut segments = Vec::with_capacity(media.segments.len());
    for source in &media.segments {
        if let Some(tag) = &source.key {
            key = match (&tag.method, &tag.uri) {
                (KeyMethod::None, _) => None,
                (KeyMethod::AES128, Some(uri)) => Some(KeyDescriptor {
                    uri: resolve(url, uri),
                    iv: tag.iv.clone(),
                }),
                (KeyMethod::AES128, None) => {
                    return Err(AppError::Playlist("AES-128 key without URI".to_string()));
                }
                (method, _) => {
                    return Err(AppError::Playlist(format!(
                        "Unsupported encryption method {method:?}"
                    )));
                }
            };
        }
        if let Some(tag) = &source.map {
            let uri = resolve(url, &tag.uri);
            let mut init = InitSegment::new(uri.clone());
            init.byte_range = tag
                .byte_range
                .as_ref()
                .map(|range| chain_range(range, &uri, &mut map_range));
            map = Some(init);
        }
        if source.discontinuity {
            timeline += 1;
        }

        let uri = resolve(url, &source.uri);
        let mut segment = Segment::new(uri.clone(), f64::from(source.duration));
        segment.timeline = timeline;
        segment.discontinuity = source.discontinuity;
        segment.byte_range = source
            .byte_range
            .as_ref()
            .map(|range| chain_range(range, &uri, &mut segment_range));
        segment.key = key.clone();
        segment.map = map.clone();
        segments.push(segment);
    }

    let mut playlist = Playlist::new(url.as_str(), media.target_duration as f64, segments);
    playlist.media_sequence = media.media_sequence;
    playlist.discontinuity_sequence = media.discontinuity_sequence;
    playlist.end_list = media.end_list;
    playlist.independent_segments = media.independent_segments;
    debug!(
        uri = %url,
        media_sequence = playlist.media_sequence,
        segments = playlist.segments.len(),
        end_list = playlist.end_list,
        "Parsed media playlist"
    );
    Ok(playlist)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Playlist {
        let url = Url::parse("https://cdn.example.com/live/index.m3u8").unwrap();
        parse_media_playlist(text.as_bytes(), &url).unwrap()
    }

    #[test]
    fn test_convert_resolves_uris_and_carries_key_and_map() {
        let playlist = parse(
            "#EXTM3U\n\
             #EXT-X-VERSION:6\n\
             #EXT-X-TARGETDURATION:6\n\
             #EXT-X-MEDIA-SEQUENCE:42\n\
             #EXT-X-MAP:URI=\"init.mp4\"\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/k1\",IV=0x00000000000000000000000000000001\n\
             #EXTINF:6.0,\n\
             seg42.m4s\n\
             #EXTINF:6.0,\n\
             seg43.m4s\n\
             #EXT-X-KEY:METHOD=NONE\n\
             #EXTINF:4.0,\n\
             seg44.m4s\n\
             #EXT-X-ENDLIST\n",
        );

        assert_eq!(playlist.media_sequence, 42);
        assert_eq!(playlist.target_duration, 6.0);
        assert!(playlist.end_list);
        assert_eq!(playlist.segments.len(), 3);
        assert_eq!(playlist.segments[0].uri, "https://cdn.example.com/live/seg42.m4s");

        let key = playlist.segments[1].key.as_ref().unwrap();
        assert_eq!(key.uri, "https://keys.example.com/k1");
        assert!(playlist.segments[2].key.is_none());

        let map = playlist.segments[2].map.as_ref().unwrap();
        assert_eq!(map.uri, "https://cdn.example.com/live/init.mp4");
    }

    #[test]
    fn test_convert_assigns_timelines_at_discontinuities() {
        let playlist = parse(
            "#EXTM3U\n\
             #EXT-X-TARGETDURATION:10\n\
             #EXT-X-DISCONTINUITY-SEQUENCE:3\n\
             #EXTINF:10.0,\n\
             a.ts\n\
             #EXT-X-DISCONTINUITY\n\
             #EXTINF:10.0,\n\
             b.ts\n\
             #EXTINF:10.0,\n\
             c.ts\n",
        );

        let timelines: Vec<u64> = playlist.segments.iter().map(|s| s.timeline).collect();
        assert_eq!(timelines, vec![3, 4, 4]);
        assert_eq!(playlist.discontinuity_starts, vec![1]);
        assert!(!playlist.end_list);
    }

    #[test]
    fn test_convert_chains_byte_range_offsets() {
        let playlist = parse(
            "#EXTM3U\n\
             #EXT-X-VERSION:4\n\
             #EXT-X-TARGETDURATION:10\n\
             #EXTINF:10.0,\n\
             #EXT-X-BYTERANGE:1000@0\n\
             main.ts\n\
             #EXTINF:10.0,\n\
             #EXT-X-BYTERANGE:500\n\
             main.ts\n\
             #EXTINF:10.0,\n\
             #EXT-X-BYTERANGE:700\n\
             main.ts\n",
        );

        let ranges: Vec<(u64, u64)> = playlist
            .segments
            .iter()
            .map(|s| s.byte_range.map(|r| (r.offset, r.length)).unwrap())
            .collect();
        assert_eq!(ranges, vec![(0, 1000), (1000, 500), (1500, 700)]);
    }

    #[test]
    fn test_master_playlist_is_rejected() {
        let url = Url::parse("https://cdn.example.com/master.m3u8").unwrap();
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1280000\nlow.m3u8\n";
        assert!(matches!(
            parse_media_playlist(text.as_bytes(), &url),
            Err(AppError::Playlist(_))
        ));
    }
}
