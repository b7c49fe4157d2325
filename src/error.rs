//! Request-level error taxonomy
//!
//! Every variant is terminal for the request it belongs to and is turned into
//! a synthesized client response; none of them reach the serving loop.

use hyper::StatusCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Why the origin gate refused a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    Blacklisted { origin: String },
    NotWhitelisted { origin: String },
    MissingRequiredHeader { name: String },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::Blacklisted { origin } => write!(
                f,
                "The origin \"{}\" was blacklisted by the operator of this proxy.",
                origin
            ),
            DenyReason::NotWhitelisted { origin } => write!(
                f,
                "The origin \"{}\" was not whitelisted by the operator of this proxy.",
                origin
            ),
            DenyReason::MissingRequiredHeader { name } => {
                write!(f, "Missing required request header: {}", name)
            }
        }
    }
}

/// Distinct causes of a failed outbound connection
#[derive(Debug, Error)]
pub enum ConnectFailure {
    #[error("DNS lookup failed: {0}")]
    Dns(#[source] io::Error),

    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid target URL: {0}")]
    MalformedTarget(String),

    #[error("{reason}")]
    PolicyDenied { reason: DenyReason },

    #[error("Too many requests from {key}. Retry after {retry_after_ms} ms.")]
    RateLimited { key: String, retry_after_ms: u64 },

    #[error("Could not reach {target}: {cause}")]
    OutboundConnectFailed {
        target: String,
        #[source]
        cause: ConnectFailure,
    },

    #[error("Upstream {target} did not answer within {}ms ({phase})", elapsed.as_millis())]
    OutboundTimeout {
        target: String,
        phase: &'static str,
        elapsed: Duration,
    },

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(#[source] hyper::Error),

    #[error("Client disconnected before the request body was forwarded")]
    ClientDisconnected,
}

impl ProxyError {
    /// Status code reported to the client for this error
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::PolicyDenied { reason } => match reason {
                DenyReason::MissingRequiredHeader { .. } => StatusCode::BAD_REQUEST,
                DenyReason::Blacklisted { .. } | DenyReason::NotWhitelisted { .. } => {
                    StatusCode::FORBIDDEN
                }
            },
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::OutboundConnectFailed { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::OutboundTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ClientDisconnected => StatusCode::BAD_REQUEST,
        }
    }

    /// Value for a `Retry-After` header, in whole seconds rounded up
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ProxyError::RateLimited { retry_after_ms, .. } => {
                Some(retry_after_ms.div_ceil(1000).max(1))
            }
            _ => None,
        }
    }
}
