//! HTTP transport seam used for segment, key and init segment requests.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::config::TransportConfig;
use crate::error::RequestError;
use crate::playlist::ByteRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Segment,
    Key,
    InitSegment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaRequest {
    pub uri: String,
    pub kind: RequestKind,
    pub byte_range: Option<ByteRange>,
    pub timeout: Option<Duration>,
}

impl MediaRequest {
    pub fn new(uri: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            uri: uri.into(),
            kind,
            byte_range: None,
            timeout: None,
        }
    }

    pub fn with_byte_range(mut self, byte_range: Option<ByteRange>) -> Self {
        self.byte_range = byte_range;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct MediaResponse {
    pub uri: String,
    pub status: u16,
    pub bytes: Bytes,
    /// Time from issuing the request until the body was complete.
    pub elapsed: Duration,
}

/// Periodic download progress of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestProgress {
    pub uri: String,
    pub bytes_received: u64,
    pub total: Option<u64>,
    pub elapsed: Duration,
}

pub type ProgressSender = mpsc::UnboundedSender<RequestProgress>;

/// Fetches resolved URIs. Dropping the returned future aborts the request.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn request(
        &self,
        request: MediaRequest,
        progress: Option<ProgressSender>,
    ) -> Result<MediaResponse, RequestError>;
}

/// Builds the reqwest client for a transport configuration.
pub fn create_client(config: &TransportConfig) -> Result<Client, RequestError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(RequestError::from)
}

/// [`HttpTransport`] on top of a `reqwest::Client`, streaming bodies so
/// progress can be reported while a segment downloads.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, RequestError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(
        &self,
        request: MediaRequest,
        progress: Option<ProgressSender>,
    ) -> Result<MediaResponse, RequestError> {
        let url = Url::parse(&request.uri).map_err(|e| RequestError::InvalidUrl {
            uri: request.uri.clone(),
            reason: e.to_string(),
        })?;

        let started = Instant::now();
        let mut request_builder = self.client.get(url);
        if let Some(range) = &request.byte_range {
            request_builder = request_builder.header(reqwest::header::RANGE, range.header_value());
        }
        if let Some(timeout) = request.timeout {
            request_builder = request_builder.timeout(timeout);
        }

        debug!(uri = %request.uri, kind = ?request.kind, "Issuing request");
        let response = request_builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RequestError::Status {
                uri: request.uri,
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let mut body = BytesMut::with_capacity(total.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            body.extend_from_slice(&chunk);
            if let Some(progress) = &progress {
                let _ = progress.send(RequestProgress {
                    uri: request.uri.clone(),
                    bytes_received: body.len() as u64,
                    total,
                    elapsed: started.elapsed(),
                });
            }
        }

        if body.is_empty() {
            return Err(RequestError::EmptyBody(request.uri));
        }

        let elapsed = started.elapsed();
        trace!(uri = %request.uri, bytes = body.len(), ?elapsed, "Request finished");
        Ok(MediaResponse {
            uri: request.uri,
            status: status.as_u16(),
            bytes: body.freeze(),
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_sending() {
        let transport = ReqwestTransport::new(&TransportConfig::default()).unwrap();
        let err = transport
            .request(MediaRequest::new("not a url", RequestKind::Segment), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidUrl { .. }));
    }

    #[test]
    fn test_request_builder() {
        let request = MediaRequest::new("https://example.com/a.ts", RequestKind::Segment)
            .with_byte_range(Some(ByteRange::new(0, 10)))
            .with_timeout(Some(Duration::from_secs(2)));
        assert_eq!(request.byte_range.map(|r| r.header_value()).as_deref(), Some("bytes=0-9"));
        assert_eq!(request.timeout, Some(Duration::from_secs(2)));
    }
}
