//! Integration tests for corsproxy
//!
//! A proxy is started on a loopback listener for each test and driven with
//! reqwest. Upstreams are wiremock servers, except where the test needs to
//! see the exact headers that arrived upstream.

use bytes::Bytes;
use corsproxy::{
    tls, CorsProbe, OutboundOptions, ProxyConfig, ProxyEngine, ProxyServer, RateLimitConfig,
};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use wiremock::matchers::{any, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Start a proxy on an ephemeral port and return its address
async fn start_proxy(config: ProxyConfig) -> SocketAddr {
    start_proxy_with_tls(config, None).await
}

async fn start_proxy_with_tls(config: ProxyConfig, tls: Option<TlsAcceptor>) -> SocketAddr {
    let engine = ProxyEngine::from_config(&config)
        .unwrap()
        .with_interceptor(CorsProbe);
    let server = Arc::new(ProxyServer::new(engine, tls));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

/// Backend that echoes the headers it received
async fn run_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("none")
                            .to_string()
                    };
                    let response_text = format!(
                        "path={}|host={}|cookie={}|xff={}|xfh={}|xfp={}|keep={}",
                        req.uri(),
                        header("host"),
                        header("cookie"),
                        header("x-forwarded-for"),
                        header("x-forwarded-host"),
                        header("x-forwarded-proto"),
                        header("x-keep"),
                    );

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(200)
                            .header("set-cookie", "session=upstream")
                            .body(Full::new(Bytes::from(response_text)))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_forwards_and_adds_cors() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-upstream", "yes")
                .set_body_string(r#"{"ok":true}"#),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = start_proxy(ProxyConfig::default()).await;
    let target = format!("{}/data", upstream.uri());

    let response = client()
        .get(format!("http://{}/{}", proxy, target))
        .header("Origin", "https://app.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "access-control-allow-origin"), Some("https://app.test"));
    assert_eq!(header(&response, "access-control-allow-credentials"), Some("true"));
    assert_eq!(header(&response, "x-request-url"), Some(target.as_str()));
    assert_eq!(header(&response, "x-final-url"), Some(target.as_str()));
    assert!(header(&response, "access-control-expose-headers")
        .unwrap()
        .contains("x-upstream"));
    assert_eq!(response.text().await.unwrap(), r#"{"ok":true}"#);
}

#[tokio::test]
async fn test_no_origin_gets_wildcard() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
        .mount(&upstream)
        .await;

    let proxy = start_proxy(ProxyConfig::default()).await;

    let response = client()
        .get(format!("http://{}/{}/", proxy, upstream.uri()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "access-control-allow-origin"), Some("*"));
    assert!(header(&response, "access-control-allow-credentials").is_none());
}

#[tokio::test]
async fn test_preflight_not_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        cors_max_age: Some(600),
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{}/{}/items", proxy, upstream.uri()),
        )
        .header("Origin", "https://app.test")
        .header("Access-Control-Request-Method", "DELETE")
        .header("Access-Control-Request-Headers", "x-custom")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "access-control-allow-origin"), Some("https://app.test"));
    assert_eq!(header(&response, "access-control-allow-methods"), Some("DELETE"));
    assert_eq!(header(&response, "access-control-allow-headers"), Some("x-custom"));
    assert_eq!(header(&response, "access-control-max-age"), Some("600"));
    assert!(response.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_whitelist_denial_not_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        origin_whitelist: vec!["https://trusted.test".into()],
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .get(format!("http://{}/{}/", proxy, upstream.uri()))
        .header("Origin", "https://evil.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert_eq!(header(&response, "access-control-allow-origin"), Some("https://evil.test"));
    assert!(response.text().await.unwrap().contains("https://evil.test"));
}

#[tokio::test]
async fn test_blacklisted_origin_denied() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        origin_blacklist: vec!["https://evil.test".into()],
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .get(format!("http://{}/{}/", proxy, upstream.uri()))
        .header("Origin", "https://EVIL.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert!(response.text().await.unwrap().contains("blacklisted"));
}

#[tokio::test]
async fn test_same_origin_redirect_stays_on_proxy() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        redirect_same_origin: true,
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .get(format!("http://{}/{}/old", proxy, upstream.uri()))
        .header("Origin", upstream.uri())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(
        header(&response, "location").unwrap(),
        format!("http://{}/{}/new", proxy, upstream.uri())
    );
    assert_eq!(
        header(&response, "access-control-allow-origin").unwrap(),
        upstream.uri()
    );
}

#[tokio::test]
async fn test_redirect_for_foreign_origin_untouched() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        redirect_same_origin: true,
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .get(format!("http://{}/{}/old", proxy, upstream.uri()))
        .header("Origin", "https://app.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(header(&response, "location"), Some("/new"));
}

#[tokio::test]
async fn test_cross_origin_redirect_untouched() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/away"))
        .respond_with(
            ResponseTemplate::new(301).insert_header("Location", "https://elsewhere.test/x"),
        )
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        redirect_same_origin: true,
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .get(format!("http://{}/{}/away", proxy, upstream.uri()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 301);
    assert_eq!(header(&response, "location"), Some("https://elsewhere.test/x"));
}

#[tokio::test]
async fn test_redirects_followed_server_side() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/start"))
        .respond_with(ResponseTemplate::new(303).insert_header("Location", "/middle"))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/middle"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/end"))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/end"))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .expect(1)
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        max_redirects: 2,
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .post(format!("http://{}/{}/start", proxy, upstream.uri()))
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let end = format!("{}/end", upstream.uri());
    assert_eq!(header(&response, "x-final-url"), Some(end.as_str()));
    assert_eq!(
        header(&response, "x-request-url").unwrap(),
        format!("{}/start", upstream.uri())
    );
    assert_eq!(
        header(&response, "x-cors-redirect-1").unwrap(),
        format!("303 {}/middle", upstream.uri())
    );
    assert_eq!(header(&response, "x-cors-redirect-2").unwrap(), format!("302 {}", end));
    assert_eq!(response.text().await.unwrap(), "done");
}

#[tokio::test]
async fn test_redirect_limit_relays_last_redirect() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/b"))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/c"))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/c"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        max_redirects: 1,
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .get(format!("http://{}/{}/a", proxy, upstream.uri()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(header(&response, "location"), Some("/c"));
}

#[tokio::test]
async fn test_temporary_redirect_never_followed() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(307).insert_header("Location", "/other"))
        .expect(1)
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        max_redirects: 5,
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .post(format!("http://{}/{}/submit", proxy, upstream.uri()))
        .body("data")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 307);
    assert!(header(&response, "x-cors-redirect-1").is_none());
}

#[tokio::test]
async fn test_query_string_preserved() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("found"))
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = start_proxy(ProxyConfig::default()).await;

    let response = client()
        .get(format!("http://{}/{}/search?q=rust&page=2", proxy, upstream.uri()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "found");
}

#[tokio::test]
async fn test_scheme_defaults_to_http() {
    let backend = run_echo_backend().await;
    let proxy = start_proxy(ProxyConfig::default()).await;

    let response = client()
        .get(format!("http://{}/{}/plain", proxy, backend))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        header(&response, "x-request-url").unwrap(),
        format!("http://{}/plain", backend)
    );
}

#[tokio::test]
async fn test_outbound_header_rewriting() {
    let backend = run_echo_backend().await;
    let config = ProxyConfig {
        remove_headers: vec!["cookie".into()],
        outbound: OutboundOptions {
            xfwd: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let proxy = start_proxy(config).await;

    let response = client()
        .get(format!("http://{}/http://{}/echo?x=1", proxy, backend))
        .header("Cookie", "secret=1")
        .header("X-Keep", "kept")
        .header("X-Forwarded-For", "203.0.113.9")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(header(&response, "set-cookie").is_none());

    let body = response.text().await.unwrap();
    assert!(body.contains("path=/echo?x=1"));
    assert!(body.contains(&format!("host={}", backend)));
    assert!(body.contains("cookie=none"));
    assert!(body.contains("keep=kept"));
    assert!(body.contains("xff=203.0.113.9, 127.0.0.1"));
    assert!(body.contains(&format!("xfh={}", proxy)));
    assert!(body.contains("xfp=http"));
}

#[tokio::test]
async fn test_malformed_target_is_400() {
    let proxy = start_proxy(ProxyConfig::default()).await;

    let response = client()
        .get(format!("http://{}/", proxy))
        .header("Origin", "https://app.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(header(&response, "access-control-allow-origin"), Some("https://app.test"));
    assert!(response.text().await.unwrap().contains("Usage"));
}

#[tokio::test]
async fn test_backend_unreachable_502() {
    // Bind then drop to find a closed port
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let proxy = start_proxy(ProxyConfig::default()).await;

    let response = client()
        .get(format!("http://{}/http://{}/", proxy, closed_addr))
        .header("Origin", "https://app.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(header(&response, "access-control-allow-origin"), Some("https://app.test"));
}

#[tokio::test]
async fn test_client_disconnect_closes_upstream() {
    // Upstream reads the request head, then never answers
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut head = Vec::new();
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "proxy closed before sending the request head");
            head.extend_from_slice(&buf[..n]);
        }
        let _ = seen_tx.send(());

        let eof = matches!(socket.read(&mut buf).await, Ok(0) | Err(_));
        let _ = closed_tx.send(eof);
    });

    let proxy = start_proxy(ProxyConfig::default()).await;
    let url = format!("http://{}/http://{}/slow", proxy, upstream_addr);

    let request = tokio::spawn(async move { client().get(url).send().await });
    timeout(Duration::from_secs(5), seen_rx)
        .await
        .expect("request never reached the upstream")
        .unwrap();

    // Dropping the in-flight request closes the client connection
    request.abort();
    let _ = request.await;

    let eof = timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("upstream connection still open after client left")
        .unwrap();
    assert!(eof);
}

#[tokio::test]
async fn test_rate_limit_429() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        rate_limit: Some(RateLimitConfig {
            max_requests: 2,
            window_ms: 60_000,
            ..Default::default()
        }),
        ..Default::default()
    };
    let proxy = start_proxy(config).await;
    let url = format!("http://{}/{}/", proxy, upstream.uri());

    for _ in 0..2 {
        let response = client().get(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }

    let response = client()
        .get(&url)
        .header("Origin", "https://app.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    assert_eq!(header(&response, "retry-after"), Some("60"));
    assert_eq!(header(&response, "access-control-allow-origin"), Some("https://app.test"));
}

#[tokio::test]
async fn test_rate_limit_exempt_client() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&upstream)
        .await;

    let config = ProxyConfig {
        rate_limit: Some(RateLimitConfig {
            max_requests: 1,
            window_ms: 60_000,
            exempt: vec!["127.0.0.1".into()],
            ..Default::default()
        }),
        ..Default::default()
    };
    let proxy = start_proxy(config).await;
    let url = format!("http://{}/{}/", proxy, upstream.uri());

    for _ in 0..3 {
        let response = client().get(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }
}

#[tokio::test]
async fn test_cors_probe() {
    let proxy = start_proxy(ProxyConfig::default()).await;

    let response = client()
        .get(format!("http://{}/iscorsneeded", proxy))
        .header("Origin", "https://app.test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(header(&response, "access-control-allow-origin").is_none());
    assert_eq!(response.text().await.unwrap(), "no");
}

#[tokio::test]
async fn test_serves_over_tls() {
    let dir = tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = cert.serialize_pem().unwrap();
    let cert_path = dir.path().join("localhost.crt");
    let key_path = dir.path().join("localhost.key");
    std::fs::write(&cert_path, &cert_pem).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    let acceptor = tls::acceptor_from_files(&cert_path, &key_path).unwrap();
    assert!(acceptor.is_some());
    let proxy = start_proxy_with_tls(ProxyConfig::default(), acceptor).await;

    let client = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(cert_pem.as_bytes()).unwrap())
        .resolve("localhost", proxy)
        .build()
        .unwrap();

    let response = client
        .get(format!("https://localhost:{}/iscorsneeded", proxy.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "no");
}
