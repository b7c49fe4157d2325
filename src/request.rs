//! Inbound request as seen by the engine

use crate::headers;
use http::request::Parts;
use hyper::header::{HeaderMap, HOST};
use hyper::{Method, Request};
use std::net::SocketAddr;

/// Connection-level facts about the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// Accepted over TLS
    pub secure: bool,
}

impl ClientInfo {
    /// `scheme://host` under which the client reached the proxy
    pub fn proxy_base(&self, headers: &HeaderMap) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let host = headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_string())
            .unwrap_or_else(|| self.local_addr.to_string());
        format!("{}://{}", scheme, host)
    }
}

/// One inbound request, owned by its handler until a response is produced
pub struct ProxyRequest<B> {
    head: Parts,
    body: B,
    client: ClientInfo,
}

impl<B> ProxyRequest<B> {
    pub fn new(request: Request<B>, client: ClientInfo) -> Self {
        let (head, body) = request.into_parts();
        Self { head, body, client }
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// Path plus query, exactly as received
    pub fn path_and_query(&self) -> &str {
        self.head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.head.uri.path())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn origin(&self) -> Option<&str> {
        headers::request_origin(&self.head.headers)
    }

    pub fn head(&self) -> &Parts {
        &self.head
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    pub fn into_parts(self) -> (Parts, B, ClientInfo) {
        (self.head, self.body, self.client)
    }
}
