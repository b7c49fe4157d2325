//! Proxy configuration
//!
//! Assembled once at startup (from CLI/env or a JSON file) and shared
//! read-only by every request handler afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid header name in {list}: {name:?}")]
    InvalidHeaderName { list: &'static str, name: String },

    #[error("rate limit window must be greater than zero")]
    ZeroRateWindow,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Which piece of the request identifies a client for rate limiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    /// The peer IP address of the inbound connection
    #[default]
    RemoteIp,
    /// The `Origin` header, falling back to the peer IP when absent
    Origin,
}

/// Sliding-window-counter limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per key and window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Keys that are never limited (compared case-insensitively)
    pub exempt: Vec<String>,
    pub key: RateLimitKey,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window_ms: 3 * 60 * 1000,
            exempt: Vec::new(),
            key: RateLimitKey::RemoteIp,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Options for the outbound leg of a proxied request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundOptions {
    /// Append X-Forwarded-For/Host/Proto to outbound requests
    pub xfwd: bool,
    pub connect_timeout_ms: u64,
    /// Bound on sending the request and receiving the upstream response head
    pub response_timeout_ms: u64,
}

impl Default for OutboundOptions {
    fn default() -> Self {
        Self {
            xfwd: false,
            connect_timeout_ms: 10_000,
            response_timeout_ms: 30_000,
        }
    }
}

impl OutboundOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Process-wide proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Origins that are always refused
    pub origin_blacklist: Vec<String>,
    /// When non-empty, only these origins are served
    pub origin_whitelist: Vec<String>,
    /// Headers every request must carry
    pub require_headers: Vec<String>,
    /// Headers dropped from outbound requests
    pub remove_headers: Vec<String>,
    /// `None` disables rate limiting
    pub rate_limit: Option<RateLimitConfig>,
    /// Rewrite same-origin redirect `Location`s back through the proxy
    pub redirect_same_origin: bool,
    /// Upstream 301/302/303 hops followed server-side; 0 disables following
    pub max_redirects: u32,
    /// `Access-Control-Max-Age` for preflight responses, in seconds
    pub cors_max_age: Option<u64>,
    pub outbound: OutboundOptions,
}

impl ProxyConfig {
    /// Load a configuration from a JSON file. Missing keys take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
