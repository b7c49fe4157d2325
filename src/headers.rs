//! Header rewriting in both directions
//!
//! Outbound: drop hop-by-hop and operator-configured headers, point `Host` at
//! the target, optionally add X-Forwarded-* metadata.
//! Inbound: drop hop-by-hop headers and cookies, attach the CORS headers the
//! browser needs, and route same-origin redirects back through the proxy.

use crate::request::ClientInfo;
use crate::target::TargetUrl;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
    ACCESS_CONTROL_REQUEST_METHOD, CONNECTION, HOST, LOCATION, ORIGIN, SET_COOKIE, VARY,
};
use hyper::{Method, StatusCode};
use tracing::debug;

/// Headers that only describe a single transport hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REQUEST_URL: &str = "x-request-url";
const X_FINAL_URL: &str = "x-final-url";

/// What the rewriter needs to know about the request a response answers
pub struct ResponseContext<'a> {
    pub method: &'a Method,
    pub request_headers: &'a HeaderMap,
    /// Target resolved from the inbound path
    pub requested: &'a TargetUrl,
    /// Target that produced this response (differs after followed redirects)
    pub final_target: &'a TargetUrl,
    /// `scheme://host` of the proxy itself, without trailing slash
    pub proxy_base: &'a str,
    /// Redirects followed server-side before this response, in order
    pub redirects: &'a [(StatusCode, TargetUrl)],
}

#[derive(Debug, Clone, Default)]
pub struct HeaderRewriter {
    strip: Vec<HeaderName>,
    xfwd: bool,
    redirect_same_origin: bool,
    cors_max_age: Option<u64>,
}

impl HeaderRewriter {
    pub fn new(
        strip: Vec<HeaderName>,
        xfwd: bool,
        redirect_same_origin: bool,
        cors_max_age: Option<u64>,
    ) -> Self {
        Self {
            strip,
            xfwd,
            redirect_same_origin,
            cors_max_age,
        }
    }

    /// Headers for the request sent to `target`
    pub fn outbound_headers(
        &self,
        inbound: &HeaderMap,
        target: &TargetUrl,
        client: &ClientInfo,
    ) -> HeaderMap {
        let tokens = connection_tokens(inbound);
        let mut out = HeaderMap::with_capacity(inbound.len() + 4);

        for (name, value) in inbound.iter() {
            if name == HOST || is_hop_by_hop(name, &tokens) || self.strip.contains(name) {
                continue;
            }
            out.append(name.clone(), value.clone());
        }

        if let Ok(host) = HeaderValue::from_str(target.authority()) {
            out.insert(HOST, host);
        }

        if self.xfwd {
            let ip = client.remote_addr.ip().to_string();
            let chain = match out.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(previous) => format!("{}, {}", previous, ip),
                None => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&chain) {
                out.insert(X_FORWARDED_FOR, value);
            }
            if let Some(host) = inbound.get(HOST) {
                out.insert(X_FORWARDED_HOST, host.clone());
            }
            out.insert(
                X_FORWARDED_PROTO,
                HeaderValue::from_static(if client.secure { "https" } else { "http" }),
            );
        }

        out
    }

    /// Headers for the response relayed back to the client
    pub fn response_headers(
        &self,
        status: StatusCode,
        upstream: &HeaderMap,
        ctx: &ResponseContext<'_>,
    ) -> HeaderMap {
        let tokens = connection_tokens(upstream);
        let mut out = HeaderMap::with_capacity(upstream.len() + 8);

        for (name, value) in upstream.iter() {
            if is_hop_by_hop(name, &tokens) || is_cookie_setter(name) {
                continue;
            }
            out.append(name.clone(), value.clone());
        }

        if is_redirect(status) {
            self.rewrite_location(&mut out, ctx);
        }

        if let Ok(value) = HeaderValue::from_str(ctx.requested.as_str()) {
            out.insert(X_REQUEST_URL, value);
        }
        if let Ok(value) = HeaderValue::from_str(ctx.final_target.as_str()) {
            out.insert(X_FINAL_URL, value);
        }

        for (hop, (status, location)) in ctx.redirects.iter().enumerate() {
            let name = HeaderName::from_bytes(format!("x-cors-redirect-{}", hop + 1).as_bytes());
            let value = HeaderValue::from_str(&format!("{} {}", status.as_u16(), location));
            if let (Ok(name), Ok(value)) = (name, value) {
                out.insert(name, value);
            }
        }

        self.apply_cors(&mut out, ctx.method, ctx.request_headers);
        out
    }

    /// CORS headers alone, for preflight replies
    pub fn cors_headers(&self, method: &Method, request_headers: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        self.apply_cors(&mut out, method, request_headers);
        out
    }

    /// Add CORS headers to `headers`. Call last: the expose list names every
    /// header already present.
    pub fn apply_cors(&self, headers: &mut HeaderMap, method: &Method, request: &HeaderMap) {
        match request_origin(request).and_then(|o| HeaderValue::from_str(o).ok()) {
            Some(origin) => {
                headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
                headers.insert(
                    ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                );
                let varies = headers
                    .get_all(VARY)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .flat_map(|v| v.split(','))
                    .any(|v| v.trim().eq_ignore_ascii_case("origin"));
                if !varies {
                    headers.append(VARY, HeaderValue::from_static("Origin"));
                }
            }
            None => {
                headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
                headers.remove(ACCESS_CONTROL_ALLOW_CREDENTIALS);
            }
        }

        if let Some(requested) = request.get(ACCESS_CONTROL_REQUEST_METHOD) {
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, requested.clone());
        }
        if let Some(requested) = request.get(ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }

        if method == Method::OPTIONS {
            if let Some(age) = self.cors_max_age {
                headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(age));
            }
        }

        let exposed = headers
            .keys()
            .map(|name| name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        if let Ok(value) = HeaderValue::from_str(&exposed) {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, value);
        }
    }

    /// Route `Location` back through the proxy when it points at the
    /// caller's own origin
    fn rewrite_location(&self, headers: &mut HeaderMap, ctx: &ResponseContext<'_>) {
        if !self.redirect_same_origin {
            return;
        }

        let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
            return;
        };

        let next = match ctx.final_target.join(location) {
            Ok(next) => next,
            Err(e) => {
                debug!("Leaving unparseable Location untouched: {}", e);
                return;
            }
        };

        let same_origin = request_origin(ctx.request_headers)
            .is_some_and(|origin| origin.trim().eq_ignore_ascii_case(&next.origin()));
        if !same_origin {
            return;
        }

        let proxied = format!("{}/{}", ctx.proxy_base, next);
        if let Ok(value) = HeaderValue::from_str(&proxied) {
            debug!("Rewriting same-origin redirect to {}", proxied);
            headers.insert(LOCATION, value);
        }
    }
}

/// The request's `Origin`, or `None` when absent or not valid text
pub fn request_origin(headers: &HeaderMap) -> Option<&str> {
    headers.get(ORIGIN).and_then(|v| v.to_str().ok())
}

/// `OPTIONS` carrying `Access-Control-Request-Method`
pub fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::OPTIONS && headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
}

pub fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Header names listed in `Connection`, lowercased
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn is_hop_by_hop(name: &HeaderName, connection_tokens: &[String]) -> bool {
    let name = name.as_str();
    HOP_BY_HOP.contains(&name) || connection_tokens.iter().any(|t| t == name)
}

fn is_cookie_setter(name: &HeaderName) -> bool {
    name == SET_COOKIE || name.as_str() == "set-cookie2"
}
