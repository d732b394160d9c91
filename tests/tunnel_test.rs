mod common;

use common::{cache_entries, exchange, raw_connect, test_client, tls_over, TestCa, TestProxy};
use pkgproxy::hashing::sha1_hex;
use pkgproxy::TunnelResponseMode;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WHEEL_PATH: &str = "/packages/ab/cd/foo-1.0-py3-none-any.whl";

async fn wheel_upstream(expected_fetches: u64) -> MockServer {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(WHEEL_PATH))
        .and(header("host", "files.pythonhosted.org"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-origin", "mock")
                .set_body_bytes(b"wheel-bytes".to_vec()),
        )
        .expect(expected_fetches)
        .mount(&upstream)
        .await;
    upstream
}

// ---------------------------------------------------------------------------
// CONNECT tunnels
// ---------------------------------------------------------------------------

/// An HTTPS download through the proxy is intercepted, fetched once and cached.
#[tokio::test]
async fn test_https_download_through_tunnel() {
    let ca = TestCa::generate();
    let upstream = wheel_upstream(1).await;
    let proxy = TestProxy::start(&ca, &upstream.uri()).await;
    let client = test_client(proxy.http_addr, &ca);
    let url = format!("https://files.pythonhosted.org{}", WHEEL_PATH);

    for _ in 0..2 {
        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/octet-stream"
        );
        assert_eq!(&resp.bytes().await.unwrap()[..], b"wheel-bytes");
    }

    assert_eq!(
        cache_entries(proxy.cache_dir.path()),
        vec!["foo-1.0-py3-none-any.whl".to_string()]
    );

    upstream.verify().await;
    proxy.shutdown();
}

/// The tunnel acknowledgment and the synthesized inner response, byte for byte.
#[tokio::test]
async fn test_tunnel_wire_format() {
    let ca = TestCa::generate();
    let upstream = wheel_upstream(1).await;
    let proxy = TestProxy::start(&ca, &upstream.uri()).await;

    let (ack, stream) = raw_connect(proxy.http_addr, "files.pythonhosted.org:443").await;
    assert_eq!(ack, "HTTP/1.1 200 Connection Established\r\n\r\n");

    let mut tls = tls_over(stream, &ca, "files.pythonhosted.org").await;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: files.pythonhosted.org\r\nUser-Agent: pip/24.0\r\n\r\n",
        WHEEL_PATH
    );
    let response = exchange(&mut tls, &request).await;

    assert_eq!(
        response,
        b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n\r\nwheel-bytes".to_vec()
    );

    upstream.verify().await;
    proxy.shutdown();
}

/// Simple index pages are labelled text/html inside the tunnel.
#[tokio::test]
async fn test_tunnel_simple_index_content_type() {
    let ca = TestCa::generate();
    let upstream = MockServer::start().await;
    Mock::given(path("/simple/foo/"))
        .and(header("host", "pypi.org"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<a>foo</a>"))
        .mount(&upstream)
        .await;
    let proxy = TestProxy::start(&ca, &upstream.uri()).await;

    let (_, stream) = raw_connect(proxy.http_addr, "pypi.org:443").await;
    let mut tls = tls_over(stream, &ca, "pypi.org").await;
    let response = exchange(
        &mut tls,
        "GET /simple/foo/ HTTP/1.1\r\nHost: pypi.org\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n"), "{}", text);
    assert!(text.ends_with("<a>foo</a>"));

    let key = format!("{}_foo", sha1_hex("https://pypi.org/simple/foo/"));
    assert_eq!(cache_entries(proxy.cache_dir.path()), vec![key]);

    proxy.shutdown();
}

/// In origin mode the tunnel relays the origin's status and headers on a miss.
#[tokio::test]
async fn test_tunnel_origin_mode_relays_headers() {
    let ca = TestCa::generate();
    let upstream = wheel_upstream(1).await;
    let proxy = TestProxy::start_with(&ca, &upstream.uri(), |config| {
        config.proxy.tunnel_response = TunnelResponseMode::Origin;
    })
    .await;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: files.pythonhosted.org\r\n\r\n",
        WHEEL_PATH
    );

    let (_, stream) = raw_connect(proxy.http_addr, "files.pythonhosted.org:443").await;
    let mut tls = tls_over(stream, &ca, "files.pythonhosted.org").await;
    let miss = String::from_utf8(exchange(&mut tls, &request).await).unwrap();
    assert!(miss.starts_with("HTTP/1.1 200 OK\r\n"), "{}", miss);
    assert!(miss.contains("x-origin: mock\r\n"), "{}", miss);
    assert!(miss.contains("content-length: 11\r\n"), "{}", miss);
    assert!(miss.ends_with("\r\n\r\nwheel-bytes"));

    let (_, stream) = raw_connect(proxy.http_addr, "files.pythonhosted.org:443").await;
    let mut tls = tls_over(stream, &ca, "files.pythonhosted.org").await;
    let hit = String::from_utf8(exchange(&mut tls, &request).await).unwrap();
    assert!(hit.starts_with("HTTP/1.1 200 OK\r\n"), "{}", hit);
    assert!(!hit.contains("x-origin"), "{}", hit);
    assert!(hit.ends_with("\r\n\r\nwheel-bytes"));

    upstream.verify().await;
    proxy.shutdown();
}

/// Error statuses keep their real code inside the tunnel and are not cached.
#[tokio::test]
async fn test_tunnel_not_found_passthrough() {
    let ca = TestCa::generate();
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
        .mount(&upstream)
        .await;
    let proxy = TestProxy::start(&ca, &upstream.uri()).await;

    let (_, stream) = raw_connect(proxy.http_addr, "pypi.org:443").await;
    let mut tls = tls_over(stream, &ca, "pypi.org").await;
    let response = exchange(
        &mut tls,
        "GET /simple/nope/ HTTP/1.1\r\nHost: pypi.org\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", text);
    assert!(text.ends_with("\r\n\r\ngone"));
    assert!(cache_entries(proxy.cache_dir.path()).is_empty());

    proxy.shutdown();
}

/// The leaf presented inside a tunnel names the CONNECT host.
#[tokio::test]
async fn test_tunnel_rejects_mismatched_name() {
    let ca = TestCa::generate();
    let upstream = MockServer::start().await;
    let proxy = TestProxy::start(&ca, &upstream.uri()).await;

    let (_, stream) = raw_connect(proxy.http_addr, "pypi.org:443").await;
    let connector = tokio_rustls::TlsConnector::from(ca.client_tls_config());
    let name = rustls::pki_types::ServerName::try_from("evil.example").unwrap();
    assert!(connector.connect(name, stream).await.is_err());

    proxy.shutdown();
}

/// A CONNECT target without a port still gets a tunnel.
#[tokio::test]
async fn test_connect_without_port() {
    let ca = TestCa::generate();
    let upstream = MockServer::start().await;
    let proxy = TestProxy::start(&ca, &upstream.uri()).await;

    let (ack, _stream) = raw_connect(proxy.http_addr, "pypi.org").await;
    assert_eq!(ack, "HTTP/1.1 200 Connection Established\r\n\r\n");

    proxy.shutdown();
}

/// A refused CONNECT destination is reported as 502 when probing is on.
#[tokio::test]
async fn test_connect_probe_failure_returns_502() {
    let ca = TestCa::generate();
    let upstream = MockServer::start().await;
    let proxy = TestProxy::start_with(&ca, &upstream.uri(), |config| {
        config.proxy.connect_probe = true;
        config.proxy.connect_timeout_secs = 2;
    })
    .await;

    let (ack, _stream) = raw_connect(proxy.http_addr, "127.0.0.1:1").await;
    assert!(ack.starts_with("HTTP/1.1 502"), "{}", ack);

    proxy.shutdown();
}

// ---------------------------------------------------------------------------
// TLS listener
// ---------------------------------------------------------------------------

/// Clients talking TLS straight to the TLS listener get a leaf for their SNI.
#[tokio::test]
async fn test_tls_listener_serves_by_sni() {
    let ca = TestCa::generate();
    let upstream = MockServer::start().await;
    Mock::given(path("/simple/foo/"))
        .and(header("host", "pypi.org"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"idx\"")
                .set_body_string("index"),
        )
        .expect(1)
        .mount(&upstream)
        .await;
    let proxy = TestProxy::start(&ca, &upstream.uri()).await;

    let stream = tokio::net::TcpStream::connect(proxy.https_addr).await.unwrap();
    let mut tls = tls_over(stream, &ca, "pypi.org").await;
    let response = exchange(
        &mut tls,
        "GET /simple/foo/ HTTP/1.1\r\nHost: pypi.org\r\nConnection: close\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
    assert!(text.to_ascii_lowercase().contains("etag: \"idx\"\r\n"), "{}", text);
    assert!(text.ends_with("\r\n\r\nindex"));

    let key = format!("{}_foo", sha1_hex("https://pypi.org/simple/foo/"));
    assert!(proxy.cache_path(&key).exists());

    upstream.verify().await;
    proxy.shutdown();
}
