//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! max_request_size = 1048576
//! not_found_body = "nothing here"
//!
//! [websocket]
//! read_buffer_size = 32768
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::http::ParseLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// WebSocket limits used by [`Upgrader::with_config`](crate::realtime::Upgrader::with_config).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Largest inbound frame payload; bigger frames close with `1009`.
    pub read_buffer_size: usize,
    /// Initial capacity of outbound frame buffers.
    pub write_buffer_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            write_buffer_size: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes a connection may buffer before a request completes. Exceeding it
    /// answers `413` and closes the connection.
    pub max_request_size: usize,
    pub max_headers: usize,
    /// Largest `Content-Length` accepted.
    pub max_body_size: usize,
    /// Capacity of each connection's accumulation buffer.
    pub initial_buffer_size: usize,
    /// Idle accumulation buffers kept for reuse.
    pub buffer_pool_capacity: usize,
    /// Body of the default `404` response.
    pub not_found_body: Option<String>,
    pub tick_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub websocket: WebSocketConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_request_size: 8 * 1024 * 1024,
            max_headers: 64,
            max_body_size: 4 * 1024 * 1024,
            initial_buffer_size: 4096,
            buffer_pool_capacity: 256,
            not_found_body: None,
            tick_interval_ms: 1000,
            shutdown_timeout_ms: 30_000,
            websocket: WebSocketConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_request_size == 0 {
            return Err(ConfigError::Invalid("max_request_size must be positive".into()));
        }
        if self.max_body_size > self.max_request_size {
            return Err(ConfigError::Invalid(format!(
                "max_body_size ({}) exceeds max_request_size ({})",
                self.max_body_size, self.max_request_size
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".into()));
        }
        if self.websocket.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "websocket.read_buffer_size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_headers: self.max_headers,
            max_body_size: self.max_body_size,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_request_size, 8 * 1024 * 1024);
        assert_eq!(config.parse_limits().max_headers, 64);
    }

    #[test]
    fn partial_overrides() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_request_size = 2048
            max_body_size = 1024
            not_found_body = "nope"

            [websocket]
            read_buffer_size = 512
            "#,
        )
        .unwrap();
        assert_eq!(config.max_request_size, 2048);
        assert_eq!(config.not_found_body.as_deref(), Some("nope"));
        assert_eq!(config.websocket.read_buffer_size, 512);
        assert_eq!(config.websocket.write_buffer_size, 4096);
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("max_request_size = 10\nmax_body_size = 20"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("max_headers = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_file("/nonexistent/evserve.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
