//! Target URL extraction
//!
//! The inbound request path, minus its leading `/`, is the URL to fetch:
//! `/https://example.test/api?x=1` or `/example.test/api` (scheme defaulted
//! to `http`). Only syntax is checked here; DNS problems surface when
//! forwarding.

use crate::error::ProxyError;
use std::fmt;
use url::{Host, Position, Url};

/// A validated destination URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    url: Url,
}

impl TargetUrl {
    /// Validate an already-parsed URL as a proxy target
    pub fn from_url(url: Url) -> Result<Self, ProxyError> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ProxyError::MalformedTarget(format!(
                    "unsupported scheme \"{}\"",
                    other
                )))
            }
        }

        match url.host() {
            None => return Err(ProxyError::MalformedTarget("missing host".into())),
            Some(Host::Domain(domain)) if !is_valid_hostname(domain) => {
                return Err(ProxyError::MalformedTarget(format!(
                    "invalid host \"{}\"",
                    domain
                )))
            }
            Some(_) => {}
        }

        Ok(Self { url })
    }

    /// Resolve a `Location` value against this target, as a browser would
    pub fn join(&self, location: &str) -> Result<Self, ProxyError> {
        let url = self
            .url
            .join(location)
            .map_err(|e| ProxyError::MalformedTarget(format!("{}: {}", location, e)))?;
        Self::from_url(url)
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Host as it appears in the URL (IPv6 literals keep their brackets)
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Host without IPv6 brackets, as used for TLS server names
    pub fn bare_host(&self) -> String {
        match self.url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => String::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_https() { 443 } else { 80 })
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// `scheme://host[:port]`, default ports omitted
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// Value for the outbound `Host` header
    pub fn authority(&self) -> &str {
        &self.url[Position::BeforeHost..Position::AfterPort]
    }

    /// Origin-form request target: path plus query, never the fragment
    pub fn request_target(&self) -> &str {
        &self.url[Position::BeforePath..Position::AfterQuery]
    }

    /// `host:port` suitable for `lookup_host`
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Turn an inbound path such as `/http://example.test/a?b=c` into a target
pub fn resolve(path: &str) -> Result<TargetUrl, ProxyError> {
    let raw = path.strip_prefix('/').unwrap_or(path);

    if raw.is_empty() {
        return Err(ProxyError::MalformedTarget("no target URL given".into()));
    }

    if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ProxyError::MalformedTarget(
            "whitespace or control characters in target".into(),
        ));
    }

    let candidate = if has_scheme(raw) {
        raw.to_string()
    } else if raw.starts_with("//") {
        format!("http:{}", raw)
    } else {
        format!("http://{}", raw)
    };

    // Special-scheme parsing skips extra slashes (`http:///x` has host `x`),
    // so an empty authority has to be caught before the URL parser sees it.
    let rest = candidate
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or_default();
    let authority_end = rest
        .find(|c: char| matches!(c, '/' | '?' | '#'))
        .unwrap_or(rest.len());
    if rest[..authority_end].is_empty() {
        return Err(ProxyError::MalformedTarget("missing host".into()));
    }

    let url = Url::parse(&candidate)
        .map_err(|e| ProxyError::MalformedTarget(format!("{}: {}", raw, e)))?;

    TargetUrl::from_url(url)
}

fn has_scheme(raw: &str) -> bool {
    match raw.find("://") {
        Some(idx) if idx > 0 => {
            let scheme = &raw[..idx];
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

/// DNS label sequence check; the URL parser has already lowercased and
/// punycode-encoded the name.
fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}
