//! corsproxy - a reverse proxy that adds CORS headers to any response
//!
//! A request for `/<target url>` is forwarded to the target and the answer is
//! relayed back with the `Access-Control-*` headers a browser needs before it
//! lets a script read a cross-origin response. Around that:
//! - Origin blacklist/whitelist and required request headers
//! - Per-client sliding-window rate limiting
//! - Preflight answered locally, never forwarded
//! - Same-origin redirects rewritten to stay on the proxy, or followed
//!   server-side
//! - Optional TLS on the listening socket

pub mod config;
pub mod error;
pub mod gate;
pub mod headers;
pub mod interceptor;
pub mod proxy;
pub mod rate_limit;
pub mod request;
pub mod server;
pub mod target;
pub mod tls;
pub mod upstream;

pub use config::{ConfigError, OutboundOptions, ProxyConfig, RateLimitConfig, RateLimitKey};
pub use error::ProxyError;
pub use interceptor::{CorsProbe, Interception, RequestInterceptor, RequestLogger};
pub use proxy::ProxyEngine;
pub use rate_limit::RateLimiter;
pub use request::{ClientInfo, ProxyRequest};
pub use server::ProxyServer;
