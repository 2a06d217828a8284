use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BufferError;
use crate::ranges::TimeRanges;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => write!(f, "audio"),
            MediaType::Video => write!(f, "video"),
        }
    }
}

/// Bytes handed to a buffer in one append.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendPayload {
    pub bytes: Bytes,
    /// Media-time span (seconds, before the timestamp offset) covered by the
    /// bytes, when known. Real decoders work it out themselves; simulated
    /// buffers use it to maintain their buffered ranges.
    pub span: Option<(f64, f64)>,
}

impl AppendPayload {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes, span: None }
    }

    pub fn with_span(mut self, start: f64, end: f64) -> Self {
        self.span = Some((start, end));
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One underlying media buffer (an MSE `SourceBuffer` or equivalent).
///
/// Mutations must not be issued concurrently; `SourceUpdater` serializes them.
#[async_trait]
pub trait MediaBuffer: Send + Sync {
    /// Append bytes; resolves once the buffer has finished updating.
    async fn append(&self, payload: AppendPayload) -> Result<(), BufferError>;

    /// Remove `[start, end)` in presentation time.
    async fn remove(&self, start: f64, end: f64) -> Result<(), BufferError>;

    fn set_timestamp_offset(&self, offset: f64);

    fn timestamp_offset(&self) -> f64;

    fn buffered(&self) -> TimeRanges;

    /// Abort the current segment parser state.
    fn abort(&self);
}
