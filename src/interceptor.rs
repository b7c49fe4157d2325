//! Hooks that see a request before the proxy does anything with it

use crate::proxy::{text_response, ProxyBody};
use crate::request::ClientInfo;
use http::request::Parts;
use hyper::header::ORIGIN;
use hyper::{Method, Response, StatusCode};
use tracing::info;

pub enum Interception {
    /// Let the proxy handle the request
    Continue,
    /// Send this response and stop
    Handled(Response<ProxyBody>),
}

/// Runs before target resolution. Returning [`Interception::Handled`] ends
/// the request with the given response; later interceptors are skipped.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, head: &Parts, client: &ClientInfo) -> Interception;
}

/// Logs who asked for what
pub struct RequestLogger;

impl RequestInterceptor for RequestLogger {
    fn intercept(&self, head: &Parts, client: &ClientInfo) -> Interception {
        let origin = head
            .headers
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown origin");
        let location = head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        info!(
            "{} {} from {} ({})",
            head.method,
            location,
            origin,
            client.remote_addr.ip()
        );
        Interception::Continue
    }
}

/// Answers `/iscorsneeded` with `no`, so a script can tell that it is
/// already talking through the proxy. No CORS headers are attached.
pub struct CorsProbe;

impl RequestInterceptor for CorsProbe {
    fn intercept(&self, head: &Parts, _client: &ClientInfo) -> Interception {
        if head.method == Method::GET && head.uri.path() == "/iscorsneeded" {
            return Interception::Handled(text_response(StatusCode::OK, "no"));
        }
        Interception::Continue
    }
}
