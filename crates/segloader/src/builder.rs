//! # Builders for LoaderConfig and TransportConfig
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use segloader::LoaderConfig;
//!
//! let config = LoaderConfig::builder()
//!     .with_goal_buffer_length(60.0)
//!     .with_request_timeout(Duration::from_secs(10))
//!     .with_key_caching(false)
//!     .build();
//! assert_eq!(config.goal_buffer_length, 60.0);
//! ```

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::config::{LoaderConfig, TransportConfig};

/// Builder for creating LoaderConfig instances with a fluent API
#[derive(Debug, Clone, Default)]
pub struct LoaderConfigBuilder {
    config: LoaderConfig,
}

impl LoaderConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_goal_buffer_length(mut self, seconds: f64) -> Self {
        self.config.goal_buffer_length = seconds;
        self
    }

    pub fn with_buffer_check_interval(mut self, interval: Duration) -> Self {
        self.config.buffer_check_interval = interval;
        self
    }

    pub fn with_key_caching(mut self, enabled: bool) -> Self {
        self.config.cache_encryption_keys = enabled;
        self
    }

    pub fn with_quota_retry_delay(mut self, delay: Duration) -> Self {
        self.config.quota_retry_delay = delay;
        self
    }

    pub fn with_quota_back_buffer(mut self, seconds: f64) -> Self {
        self.config.quota_back_buffer = seconds;
        self
    }

    pub fn with_back_buffer_length(mut self, seconds: f64) -> Self {
        self.config.back_buffer_length = seconds;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    pub fn with_initial_bandwidth(mut self, bits_per_second: f64) -> Self {
        self.config.initial_bandwidth = bits_per_second;
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> LoaderConfig {
        self.config
    }
}

/// Builder for creating TransportConfig instances with a fluent API
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a custom header; invalid names or values are skipped with a warning.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.config.headers.insert(name, value);
            }
            _ => warn!(header = name, "Ignoring invalid header"),
        }
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.config.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn build(self) -> TransportConfig {
        self.config
    }
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_builder_overrides_defaults() {
        let config = LoaderConfig::builder()
            .with_goal_buffer_length(12.0)
            .with_key_caching(false)
            .with_quota_retry_delay(Duration::from_millis(10))
            .build();
        assert_eq!(config.goal_buffer_length, 12.0);
        assert!(!config.cache_encryption_keys);
        assert_eq!(config.quota_retry_delay, Duration::from_millis(10));
        assert_eq!(config.buffer_check_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_transport_builder_headers() {
        let config = TransportConfig::builder()
            .with_header("X-Token", "abc")
            .with_header("bad header", "x")
            .with_user_agent("test/1.0")
            .build();
        assert_eq!(config.headers.get("x-token").unwrap(), "abc");
        assert_eq!(config.user_agent, "test/1.0");
        assert!(config.headers.get(reqwest::header::ACCEPT).is_some());
    }
}
