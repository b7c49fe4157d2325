//! corsproxy - Main entry point

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use corsproxy::{
    tls, CorsProbe, OutboundOptions, ProxyConfig, ProxyEngine, ProxyServer, RateLimitConfig,
    RateLimitKey, RequestLogger,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_REMOVE_HEADERS: &str =
    "cookie,cookie2,x-request-start,x-request-id,via,connect-time,total-route-time";

/// corsproxy - Adds CORS headers to the proxied request
#[derive(Parser, Debug)]
#[command(name = "corsproxy")]
#[command(version = "1.0.0")]
#[command(about = "A reverse proxy that adds CORS headers to any response")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// PEM certificate chain; TLS is enabled when this and --ssl-key exist
    #[arg(long, env = "SSL_CERT")]
    ssl_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "SSL_KEY")]
    ssl_key: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// JSON configuration file; replaces the policy flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Origins that may not use the proxy
    #[arg(long, env = "ORIGIN_BLACKLIST", value_delimiter = ',')]
    origin_blacklist: Vec<String>,

    /// If set, only these origins may use the proxy
    #[arg(long, env = "ORIGIN_WHITELIST", value_delimiter = ',')]
    origin_whitelist: Vec<String>,

    /// Headers every request must carry
    #[arg(long, env = "REQUIRE_HEADERS", value_delimiter = ',')]
    require_headers: Vec<String>,

    /// Headers stripped before forwarding
    #[arg(long, env = "REMOVE_HEADERS", value_delimiter = ',', default_value = DEFAULT_REMOVE_HEADERS)]
    remove_headers: Vec<String>,

    /// Requests allowed per client per window; unset disables rate limiting
    #[arg(long, env = "RATE_LIMIT_MAX")]
    rate_limit_max: Option<u32>,

    /// Rate limit window in milliseconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value = "180000")]
    rate_limit_window_ms: u64,

    /// Client keys (IPs or origins) never rate limited
    #[arg(long, env = "RATE_LIMIT_EXEMPT", value_delimiter = ',')]
    rate_limit_exempt: Vec<String>,

    /// What identifies a client for rate limiting: remote_ip or origin
    #[arg(long, env = "RATE_LIMIT_KEY", default_value = "remote_ip", value_parser = parse_rate_limit_key)]
    rate_limit_key: RateLimitKey,

    /// Rewrite same-origin redirects so they stay on the proxy
    #[arg(long, env = "REDIRECT_SAME_ORIGIN", default_value_t = true, action = ArgAction::Set)]
    redirect_same_origin: bool,

    /// Redirects (301/302/303) followed server-side; 0 relays them
    #[arg(long, env = "MAX_REDIRECTS", default_value = "0")]
    max_redirects: u32,

    /// Access-Control-Max-Age for preflight responses, in seconds
    #[arg(long, env = "CORS_MAX_AGE")]
    cors_max_age: Option<u64>,

    /// Add X-Forwarded-* headers to outbound requests
    #[arg(long, env = "XFWD", default_value_t = false, action = ArgAction::Set)]
    xfwd: bool,

    /// Outbound connect timeout in milliseconds
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value = "10000")]
    connect_timeout_ms: u64,

    /// Outbound response header timeout in milliseconds
    #[arg(long, env = "RESPONSE_TIMEOUT_MS", default_value = "30000")]
    response_timeout_ms: u64,
}

impl Args {
    fn proxy_config(&self) -> Result<ProxyConfig> {
        if let Some(path) = &self.config {
            let config = ProxyConfig::from_json_file(path)?;
            info!("Loaded configuration from {}", path.display());
            return Ok(config);
        }

        Ok(ProxyConfig {
            origin_blacklist: non_empty(&self.origin_blacklist),
            origin_whitelist: non_empty(&self.origin_whitelist),
            require_headers: non_empty(&self.require_headers),
            remove_headers: non_empty(&self.remove_headers),
            rate_limit: self.rate_limit_max.map(|max_requests| RateLimitConfig {
                max_requests,
                window_ms: self.rate_limit_window_ms,
                exempt: non_empty(&self.rate_limit_exempt),
                key: self.rate_limit_key,
            }),
            redirect_same_origin: self.redirect_same_origin,
            max_redirects: self.max_redirects,
            cors_max_age: self.cors_max_age,
            outbound: OutboundOptions {
                xfwd: self.xfwd,
                connect_timeout_ms: self.connect_timeout_ms,
                response_timeout_ms: self.response_timeout_ms,
            },
        })
    }
}

/// Fall back to `legacy` when the flag and its primary variable left the
/// list empty. Deployments that predate `ORIGIN_*` use `CORSANYWHERE_*`.
fn with_legacy_list(values: Vec<String>, legacy: Option<String>) -> Vec<String> {
    if !non_empty(&values).is_empty() {
        return values;
    }
    match legacy {
        Some(raw) => non_empty(&raw.split(',').map(str::to_string).collect::<Vec<_>>()),
        None => values,
    }
}

/// `FOO=` yields one empty element; drop those
fn non_empty(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_rate_limit_key(value: &str) -> Result<RateLimitKey, String> {
    match value.trim().to_lowercase().as_str() {
        "remote_ip" | "ip" => Ok(RateLimitKey::RemoteIp),
        "origin" => Ok(RateLimitKey::Origin),
        other => Err(format!("expected remote_ip or origin, got {}", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let mut args = Args::parse();
    args.origin_blacklist = with_legacy_list(
        args.origin_blacklist,
        std::env::var("CORSANYWHERE_BLACKLIST").ok(),
    );
    args.origin_whitelist = with_legacy_list(
        args.origin_whitelist,
        std::env::var("CORSANYWHERE_WHITELIST").ok(),
    );

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting corsproxy v1.0.0");

    let config = args.proxy_config()?;
    if !config.origin_whitelist.is_empty() {
        info!("Origin whitelist: {}", config.origin_whitelist.join(", "));
    }
    if let Some(limit) = &config.rate_limit {
        info!(
            "Rate limit: {} requests per {} ms per {:?}",
            limit.max_requests, limit.window_ms, limit.key
        );
    }

    let engine = ProxyEngine::from_config(&config)
        .context("Invalid proxy configuration")?
        .with_interceptor(RequestLogger)
        .with_interceptor(CorsProbe);

    let tls = match (&args.ssl_cert, &args.ssl_key) {
        (Some(cert), Some(key)) => {
            let acceptor = tls::acceptor_from_files(cert, key)?;
            if acceptor.is_none() {
                warn!(
                    "TLS files {} / {} not found, serving plain HTTP",
                    cert.display(),
                    key.display()
                );
            }
            acceptor
        }
        _ => None,
    };

    let addr = SocketAddr::new(args.host, args.port);
    let server = Arc::new(ProxyServer::new(engine, tls));

    server.run(addr).await
}
