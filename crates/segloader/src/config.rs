use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

const DEFAULT_USER_AGENT: &str = concat!("segloader/", env!("CARGO_PKG_VERSION"));

/// Options for the HTTP client behind [`crate::transport::ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Overall timeout for a request, zero disables it
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: TransportConfig::get_default_headers(),
        }
    }
}

impl TransportConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers
    }
}

/// Tuning of a segment loader.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Seconds of content to keep buffered ahead of the playhead
    pub goal_buffer_length: f64,

    /// Interval of the buffer check timer
    pub buffer_check_interval: Duration,

    /// Cache fetched decryption keys by uri
    pub cache_encryption_keys: bool,

    /// Delay before retrying an append that hit the buffer quota
    pub quota_retry_delay: Duration,

    /// Content within this many seconds behind the playhead survives quota recovery
    pub quota_back_buffer: f64,

    /// Content older than this behind the playhead is trimmed before each request
    pub back_buffer_length: f64,

    /// Timeout of a single segment, key or init segment request
    pub request_timeout: Option<Duration>,

    /// Bandwidth estimate (bits per second) before the first sample
    pub initial_bandwidth: f64,

    /// Capacity of the loader's event channel
    pub event_channel_capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            goal_buffer_length: 30.0,
            buffer_check_interval: Duration::from_millis(500),
            cache_encryption_keys: true,
            quota_retry_delay: Duration::from_secs(1),
            quota_back_buffer: 1.0,
            back_buffer_length: 30.0,
            request_timeout: None,
            initial_bandwidth: 0.0,
            event_channel_capacity: 128,
        }
    }
}

impl LoaderConfig {
    pub fn builder() -> crate::builder::LoaderConfigBuilder {
        crate::builder::LoaderConfigBuilder::new()
    }
}
