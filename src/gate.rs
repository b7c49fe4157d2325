//! Origin policy gate
//!
//! Checks run in a fixed order and the first match wins: blacklist,
//! whitelist, required headers, then the rate limiter. The limiter runs last
//! so refused requests never spend quota.

use crate::error::{DenyReason, ProxyError};
use crate::rate_limit::RateLimiter;
use hyper::header::{HeaderMap, HeaderName};
use std::sync::Arc;

/// Result of evaluating one request against the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    DenyBlacklisted,
    DenyNotWhitelisted,
    DenyRateLimited { retry_after_ms: u64 },
    DenyMissingRequiredHeader(String),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// Convert a denial into the error reported to the client.
    /// `origin` and `client_key` only feed the diagnostic text.
    pub fn into_error(self, origin: Option<&str>, client_key: &str) -> Option<ProxyError> {
        let origin = origin.unwrap_or_default().to_string();
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::DenyBlacklisted => Some(ProxyError::PolicyDenied {
                reason: DenyReason::Blacklisted { origin },
            }),
            PolicyDecision::DenyNotWhitelisted => Some(ProxyError::PolicyDenied {
                reason: DenyReason::NotWhitelisted { origin },
            }),
            PolicyDecision::DenyMissingRequiredHeader(name) => Some(ProxyError::PolicyDenied {
                reason: DenyReason::MissingRequiredHeader { name },
            }),
            PolicyDecision::DenyRateLimited { retry_after_ms } => Some(ProxyError::RateLimited {
                key: client_key.to_string(),
                retry_after_ms,
            }),
        }
    }
}

pub struct OriginGate {
    blacklist: Vec<String>,
    whitelist: Vec<String>,
    required_headers: Vec<HeaderName>,
    limiter: Option<Arc<RateLimiter>>,
}

impl OriginGate {
    pub fn new(
        blacklist: Vec<String>,
        whitelist: Vec<String>,
        required_headers: Vec<HeaderName>,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        Self {
            blacklist,
            whitelist,
            required_headers,
            limiter,
        }
    }

    /// Evaluate a request. A missing `Origin` is matched against the
    /// blacklist through the target host, and against the whitelist as the
    /// empty string (so an explicit `""` entry admits origin-less requests).
    pub fn evaluate(
        &self,
        origin: Option<&str>,
        target_host: &str,
        client_key: &str,
        headers: &HeaderMap,
    ) -> PolicyDecision {
        let blacklist_subject = origin.unwrap_or(target_host);
        if matches_any(&self.blacklist, blacklist_subject) {
            return PolicyDecision::DenyBlacklisted;
        }

        if !self.whitelist.is_empty() && !matches_any(&self.whitelist, origin.unwrap_or_default())
        {
            return PolicyDecision::DenyNotWhitelisted;
        }

        if let Some(missing) = self
            .required_headers
            .iter()
            .find(|name| !headers.contains_key(*name))
        {
            return PolicyDecision::DenyMissingRequiredHeader(missing.as_str().to_string());
        }

        if let Some(limiter) = &self.limiter {
            let check = limiter.check(client_key);
            if !check.allowed {
                return PolicyDecision::DenyRateLimited {
                    retry_after_ms: check.retry_after_ms,
                };
            }
        }

        PolicyDecision::Allow
    }
}

fn matches_any(entries: &[String], value: &str) -> bool {
    entries
        .iter()
        .any(|entry| entry.trim().eq_ignore_ascii_case(value.trim()))
}
