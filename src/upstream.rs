//! Outbound HTTP/1.1 client
//!
//! One fresh connection per forwarded request. DNS, TCP connect and TLS are
//! separate steps so each failure is reported with its own cause. The
//! connection task is owned by the returned response body and aborted when
//! that body is dropped, which is what cancels the upstream socket when the
//! client goes away.

use crate::error::{ConnectFailure, ProxyError};
use crate::target::TargetUrl;
use crate::tls;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use rustls::pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of requests sent upstream
pub type OutboundBody = UnsyncBoxBody<Bytes, BoxError>;

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Marks an error raised by the inbound body while it was being forwarded
#[derive(Debug)]
pub struct ClientBodyError(pub BoxError);

impl std::fmt::Display for ClientBodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client body error: {}", self.0)
    }
}

impl std::error::Error for ClientBodyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Aborts the connection task when dropped
#[derive(Debug)]
struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pin_project! {
    /// Upstream response body that keeps its connection alive while read
    pub struct UpstreamBody {
        #[pin]
        inner: Incoming,
        guard: ConnectionGuard,
    }
}

impl Body for UpstreamBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pub struct Upstream {
    tls: TlsConnector,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl Upstream {
    pub fn new(connect_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            tls: tls::client_connector(),
            connect_timeout,
            response_timeout,
        }
    }

    /// Send `request` to `target` and return the response once its head
    /// has arrived. The body is streamed by the caller.
    pub async fn send(
        &self,
        target: &TargetUrl,
        request: Request<OutboundBody>,
    ) -> Result<Response<UpstreamBody>, ProxyError> {
        let stream = timeout(self.connect_timeout, self.connect(target))
            .await
            .map_err(|_| ProxyError::OutboundTimeout {
                target: target.to_string(),
                phase: "connect",
                elapsed: self.connect_timeout,
            })??;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ProxyError::UpstreamProtocol)?;

        let authority = target.socket_addr();
        let guard = ConnectionGuard(tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection to {} ended: {}", authority, e);
            }
        }));

        let response = timeout(self.response_timeout, sender.send_request(request))
            .await
            .map_err(|_| ProxyError::OutboundTimeout {
                target: target.to_string(),
                phase: "response",
                elapsed: self.response_timeout,
            })?
            .map_err(classify_send_error)?;

        Ok(response.map(|inner| UpstreamBody { inner, guard }))
    }

    async fn connect(&self, target: &TargetUrl) -> Result<Box<dyn Transport>, ProxyError> {
        let connect_failed = |cause| ProxyError::OutboundConnectFailed {
            target: target.to_string(),
            cause,
        };

        let addrs: Vec<_> = lookup_host(target.socket_addr())
            .await
            .map_err(|e| connect_failed(ConnectFailure::Dns(e)))?
            .collect();

        if addrs.is_empty() {
            return Err(connect_failed(ConnectFailure::Dns(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", target.host()),
            ))));
        }

        let mut last_error = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    trace!("Connected to {} via {}", target.host(), addr);
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        let tcp = match tcp {
            Some(stream) => stream,
            None => {
                let e = last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected));
                return Err(connect_failed(ConnectFailure::Connect(e)));
            }
        };
        let _ = tcp.set_nodelay(true);

        if !target.is_https() {
            return Ok(Box::new(tcp));
        }

        let host = target.bare_host();
        let server_name = ServerName::try_from(host.as_str())
            .map(|name| name.to_owned())
            .map_err(|e| {
                connect_failed(ConnectFailure::Tls(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    e.to_string(),
                )))
            })?;

        let tls_stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| connect_failed(ConnectFailure::Tls(e)))?;

        Ok(Box::new(tls_stream))
    }
}

/// A send failure caused by the inbound body means the client went away
fn classify_send_error(err: hyper::Error) -> ProxyError {
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if cause.is::<ClientBodyError>() {
            return ProxyError::ClientDisconnected;
        }
        source = cause.source();
    }
    ProxyError::UpstreamProtocol(err)
}
