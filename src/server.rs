//! Listening socket and per-connection HTTP/1.1 service

use crate::proxy::ProxyEngine;
use crate::request::{ClientInfo, ProxyRequest};
use anyhow::{anyhow, Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

pub struct ProxyServer {
    engine: Arc<ProxyEngine>,
    tls: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(engine: ProxyEngine, tls: Option<TlsAcceptor>) -> Self {
        Self {
            engine: Arc::new(engine),
            tls,
        }
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        info!("CORS proxy listening on {}://{}", scheme, local_addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr()?;

        match &self.tls {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .context("TLS handshake failed")?;
                let client = ClientInfo {
                    remote_addr,
                    local_addr,
                    secure: true,
                };
                serve_connection(self.engine.clone(), stream, client).await
            }
            None => {
                let client = ClientInfo {
                    remote_addr,
                    local_addr,
                    secure: false,
                };
                serve_connection(self.engine.clone(), stream, client).await
            }
        }
    }
}

async fn serve_connection<S>(engine: Arc<ProxyEngine>, stream: S, client: ClientInfo) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let io = TokioIo::new(stream);

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(
            io,
            service_fn(move |req: Request<Incoming>| {
                let engine = engine.clone();
                async move {
                    let response = engine.handle(ProxyRequest::new(req, client)).await;
                    Ok::<_, Infallible>(response)
                }
            }),
        )
        .await
        .map_err(|e| anyhow!("HTTP service error: {}", e))
}
