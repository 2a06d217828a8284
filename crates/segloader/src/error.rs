use std::sync::Arc;

use crate::buffer::MediaType;

/// Transport level failures. Only `Aborted` is not counted as an errored request.
#[derive(Debug, thiserror::Error, Clone)]
pub enum RequestError {
    #[error("HTTP status {status} for {uri}")]
    Status { uri: String, status: u16 },
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Request aborted: {0}")]
    Aborted(String),
    #[error("Empty response body from {0}")]
    EmptyBody(String),
    #[error("Invalid URL {uri}: {reason}")]
    InvalidUrl { uri: String, reason: String },
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },
    #[error("Transport error: {0}")]
    Transport(String),
}

// Manual implementation because of the Arc wrapping.
impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            let uri = err.url().map(|u| u.to_string()).unwrap_or_default();
            return RequestError::Timeout(uri);
        }
        RequestError::Network {
            source: Arc::new(err),
        }
    }
}

impl RequestError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RequestError::Aborted(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors reported by an underlying media buffer.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum BufferError {
    #[error("Quota exceeded")]
    QuotaExceeded,
    #[error("Invalid buffer state: {0}")]
    InvalidState(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Buffer operation aborted")]
    Aborted,
    #[error("No {0} buffer attached")]
    Missing(MediaType),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum DecryptError {
    #[error("Invalid key length: {0} bytes (expected 16)")]
    KeyLength(usize),
    #[error("Failed to parse IV '{iv}': {reason}")]
    InvalidIv { iv: String, reason: String },
    #[error("Decryption failed: {0}")]
    Cipher(String),
    #[error("Key bytes unavailable for {0}")]
    MissingKey(String),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TransmuxError {
    #[error("Transmuxer failed: {0}")]
    Failed(String),
    #[error("Transmuxer closed before signalling completion")]
    Closed,
    #[error("Init segment probe failed: {0}")]
    Probe(String),
}

/// Category of a loader error. Decides recovery and whether the rendition is
/// excluded from future selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Decrypt,
    Transmux,
    IllegalMediaSwitch,
    Append,
    QuotaExceeded,
}

impl ErrorKind {
    /// Network, timeout, decrypt and transmux failures are retried by the
    /// scheduling loop once the loader is resumed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Decrypt | ErrorKind::Transmux
        )
    }
}

/// Structured payload of a loader `error` event.
#[derive(Debug, thiserror::Error, Clone)]
#[error("{kind:?}: {message}")]
pub struct LoaderError {
    pub kind: ErrorKind,
    pub message: String,
    pub uri: Option<String>,
    pub status: Option<u16>,
    pub bytes: Option<usize>,
    pub media_index: Option<usize>,
    /// Set for fatal errors that should exclude the current rendition.
    pub exclude_playlist: bool,
}

impl LoaderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            uri: None,
            status: None,
            bytes: None,
            media_index: None,
            exclude_playlist: false,
        }
    }

    pub fn from_request(err: &RequestError, uri: &str, media_index: usize) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Network
        };
        Self {
            uri: Some(uri.to_string()),
            status: err.status(),
            media_index: Some(media_index),
            ..Self::new(kind, err.to_string())
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn with_media_index(mut self, media_index: usize) -> Self {
        self.media_index = Some(media_index);
        self
    }

    pub fn excluding_playlist(mut self) -> Self {
        self.exclude_playlist = true;
        self
    }

    pub fn is_fatal(&self) -> bool {
        !self.kind.is_recoverable()
    }
}

impl From<DecryptError> for LoaderError {
    fn from(err: DecryptError) -> Self {
        LoaderError::new(ErrorKind::Decrypt, err.to_string())
    }
}

impl From<TransmuxError> for LoaderError {
    fn from(err: TransmuxError) -> Self {
        LoaderError::new(ErrorKind::Transmux, err.to_string())
    }
}
