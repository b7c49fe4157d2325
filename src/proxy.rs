//! Proxy engine
//!
//! Drives one inbound request through
//! `Received → Resolving → Gating → {PreflightReply | Forwarding} → Responding → Done`,
//! with `Errored` reachable from any of them. Every request ends in exactly
//! one response, and every response the proxy synthesizes itself still
//! carries CORS headers so the calling script can see what went wrong.

use crate::config::{ConfigError, ProxyConfig, RateLimitKey};
use crate::error::ProxyError;
use crate::gate::OriginGate;
use crate::headers::{self, HeaderRewriter, ResponseContext};
use crate::interceptor::{Interception, RequestInterceptor};
use crate::rate_limit::RateLimiter;
use crate::request::{ClientInfo, ProxyRequest};
use crate::target::{self, TargetUrl};
use crate::upstream::{BoxError, ClientBodyError, OutboundBody, Upstream, UpstreamBody};
use bytes::Bytes;
use http::request::Parts;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RETRY_AFTER,
};
use hyper::{Method, Request, Response, StatusCode, Version};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Body type of every response the proxy sends
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

const USAGE: &str = "Usage: /<url>, for example /https://example.com/path?query";

/// Per-request processing stage. Ordered: a request only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Resolving,
    Gating,
    PreflightReply,
    Forwarding,
    Responding,
    Done,
    Errored,
}

struct Lifecycle {
    stage: Stage,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            stage: Stage::Received,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(
            next > self.stage,
            "request cannot move from {:?} back to {:?}",
            self.stage,
            next
        );
        debug!("{:?} -> {:?}", self.stage, next);
        self.stage = next;
    }
}

pub struct ProxyEngine {
    gate: OriginGate,
    rewriter: HeaderRewriter,
    upstream: Upstream,
    rate_limit_key: RateLimitKey,
    max_redirects: u32,
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
}

impl ProxyEngine {
    /// Build an engine around an explicitly owned rate limiter. `None`
    /// disables rate limiting regardless of `config.rate_limit`.
    pub fn new(config: &ProxyConfig, limiter: Option<Arc<RateLimiter>>) -> Result<Self, ConfigError> {
        let required = parse_header_names("require_headers", &config.require_headers)?;
        let strip = parse_header_names("remove_headers", &config.remove_headers)?;

        if config.rate_limit.as_ref().is_some_and(|r| r.window_ms == 0) {
            return Err(ConfigError::ZeroRateWindow);
        }

        Ok(Self {
            gate: OriginGate::new(
                config.origin_blacklist.clone(),
                config.origin_whitelist.clone(),
                required,
                limiter,
            ),
            rewriter: HeaderRewriter::new(
                strip,
                config.outbound.xfwd,
                config.redirect_same_origin,
                config.cors_max_age,
            ),
            upstream: Upstream::new(
                config.outbound.connect_timeout(),
                config.outbound.response_timeout(),
            ),
            rate_limit_key: config
                .rate_limit
                .as_ref()
                .map(|r| r.key)
                .unwrap_or_default(),
            max_redirects: config.max_redirects,
            interceptors: Vec::new(),
        })
    }

    /// Build an engine with a fresh limiter taken from `config.rate_limit`
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let limiter = config
            .rate_limit
            .as_ref()
            .map(|r| Arc::new(RateLimiter::from_config(r)));
        Self::new(config, limiter)
    }

    /// Register an interceptor; they run in registration order
    pub fn with_interceptor<I: RequestInterceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Handle one inbound request. Never fails: errors become responses.
    pub async fn handle<B>(&self, request: ProxyRequest<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let span = info_span!("request", id = %Uuid::new_v4(), method = %request.method());
        let mut lifecycle = Lifecycle::new();
        self.process(request, &mut lifecycle).instrument(span).await
    }

    async fn process<B>(
        &self,
        request: ProxyRequest<B>,
        lifecycle: &mut Lifecycle,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {

        for interceptor in &self.interceptors {
            if let Interception::Handled(response) =
                interceptor.intercept(request.head(), request.client())
            {
                lifecycle.advance(Stage::Done);
                return response;
            }
        }

        lifecycle.advance(Stage::Resolving);
        let target = match target::resolve(request.path_and_query()) {
            Ok(target) => target,
            Err(e) => {
                return self.fail(lifecycle, request.method(), request.headers(), e);
            }
        };

        lifecycle.advance(Stage::Gating);
        let origin = request.origin();
        let client_key = self.client_key(&request);
        let decision = self
            .gate
            .evaluate(origin, target.host(), &client_key, request.headers());
        if let Some(e) = decision.into_error(origin, &client_key) {
            return self.fail(lifecycle, request.method(), request.headers(), e);
        }

        if headers::is_preflight(request.method(), request.headers()) {
            lifecycle.advance(Stage::PreflightReply);
            let response = self.preflight_response(request.method(), request.headers());
            lifecycle.advance(Stage::Responding);
            lifecycle.advance(Stage::Done);
            return response;
        }

        lifecycle.advance(Stage::Forwarding);
        let (head, body, client) = request.into_parts();
        match self.forward(&head, body, &client, target).await {
            Ok(response) => {
                lifecycle.advance(Stage::Responding);
                lifecycle.advance(Stage::Done);
                response
            }
            Err(e) => self.fail(lifecycle, &head.method, &head.headers, e),
        }
    }

    fn client_key<B>(&self, request: &ProxyRequest<B>) -> String {
        let ip = request.client().remote_addr.ip().to_string();
        match self.rate_limit_key {
            RateLimitKey::RemoteIp => ip,
            RateLimitKey::Origin => request.origin().map(str::to_string).unwrap_or(ip),
        }
    }

    /// Send the request upstream, following 301/302/303 server-side while
    /// `max_redirects` allows, and relay the final response.
    async fn forward<B>(
        &self,
        head: &Parts,
        body: B,
        client: &ClientInfo,
        requested: TargetUrl,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut method = head.method.clone();
        let mut body: OutboundBody = body
            .map_err(|e| -> BoxError { Box::new(ClientBodyError(e.into())) })
            .boxed_unsync();
        let mut target = requested.clone();
        let mut redirects: Vec<(StatusCode, TargetUrl)> = Vec::new();

        loop {
            let mut headers = self.rewriter.outbound_headers(&head.headers, &target, client);
            if !redirects.is_empty() {
                headers.remove(CONTENT_LENGTH);
                headers.remove(CONTENT_TYPE);
            }

            let mut outbound = Request::builder()
                .method(method.clone())
                .uri(target.request_target())
                .version(Version::HTTP_11)
                .body(body)
                .map_err(|e| ProxyError::MalformedTarget(e.to_string()))?;
            *outbound.headers_mut() = headers;

            debug!("Forwarding {} {}", method, target);
            let response = self.upstream.send(&target, outbound).await?;

            if let Some(next) = self.redirect_to_follow(&response, &target, redirects.len()) {
                info!("Following {} redirect to {}", response.status(), next);
                redirects.push((response.status(), next.clone()));
                drop(response);

                method = Method::GET;
                body = empty_outbound_body();
                target = next;
                continue;
            }

            return Ok(self.relay(response, head, client, &requested, &target, &redirects));
        }
    }

    fn redirect_to_follow(
        &self,
        response: &Response<UpstreamBody>,
        target: &TargetUrl,
        followed: usize,
    ) -> Option<TargetUrl> {
        if followed >= self.max_redirects as usize {
            return None;
        }
        // 307/308 would need the original body replayed
        if !matches!(response.status().as_u16(), 301 | 302 | 303) {
            return None;
        }
        let location = response.headers().get(LOCATION)?.to_str().ok()?;
        target.join(location).ok()
    }

    fn relay(
        &self,
        response: Response<UpstreamBody>,
        head: &Parts,
        client: &ClientInfo,
        requested: &TargetUrl,
        final_target: &TargetUrl,
        redirects: &[(StatusCode, TargetUrl)],
    ) -> Response<ProxyBody> {
        let (parts, body) = response.into_parts();
        let proxy_base = client.proxy_base(&head.headers);

        let ctx = ResponseContext {
            method: &head.method,
            request_headers: &head.headers,
            requested,
            final_target,
            proxy_base: &proxy_base,
            redirects,
        };
        let headers = self.rewriter.response_headers(parts.status, &parts.headers, &ctx);

        debug!("Upstream answered {} for {}", parts.status, final_target);

        let mut relayed = Response::new(body.boxed_unsync());
        *relayed.status_mut() = parts.status;
        *relayed.headers_mut() = headers;
        relayed
    }

    fn preflight_response(&self, method: &Method, headers: &HeaderMap) -> Response<ProxyBody> {
        let mut response = Response::new(empty_body());
        *response.headers_mut() = self.rewriter.cors_headers(method, headers);
        response
    }

    fn fail(
        &self,
        lifecycle: &mut Lifecycle,
        method: &Method,
        headers: &HeaderMap,
        err: ProxyError,
    ) -> Response<ProxyBody> {
        lifecycle.advance(Stage::Errored);

        match &err {
            ProxyError::MalformedTarget(_) => debug!("Rejected: {}", err),
            ProxyError::PolicyDenied { .. } | ProxyError::RateLimited { .. } => {
                info!("Denied: {}", err)
            }
            ProxyError::ClientDisconnected => debug!("{}", err),
            _ => warn!("{}", err),
        }

        self.error_response(method, headers, &err)
    }

    fn error_response(
        &self,
        method: &Method,
        headers: &HeaderMap,
        err: &ProxyError,
    ) -> Response<ProxyBody> {
        let message = match err {
            ProxyError::MalformedTarget(_) => format!("{}\n{}\n", err, USAGE),
            _ => format!("{}\n", err),
        };

        let mut response = text_response(err.status(), &message);
        if let Some(secs) = err.retry_after_secs() {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }

        self.rewriter
            .apply_cors(response.headers_mut(), method, headers);
        response
    }
}

fn parse_header_names(list: &'static str, names: &[String]) -> Result<Vec<HeaderName>, ConfigError> {
    names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| ConfigError::InvalidHeaderName {
                list,
                name: name.to_string(),
            })
        })
        .collect()
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty_outbound_body() -> OutboundBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
