//! Test infrastructure for end-to-end proxy tests.
#![allow(dead_code)]

use pkgproxy::config::Config;
use pkgproxy::tls::{CertificateAuthority, GeneratedCa};
use pkgproxy::ProxyServer;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

// ---------------------------------------------------------------------------
// TestCa
// ---------------------------------------------------------------------------

/// A root CA generated into a tempdir.
pub struct TestCa {
    pub cert_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub dir: TempDir,
    pub cert_path: String,
    pub key_path: String,
}

impl TestCa {
    pub fn generate() -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let generated = GeneratedCa::generate().unwrap();
        let ca = CertificateAuthority::from_pem(&generated.cert_pem, &generated.key_pem).unwrap();
        let cert_der = ca.cert_der().clone();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        generated.save(&cert_path, &key_path).unwrap();

        Self {
            cert_pem: generated.cert_pem,
            cert_der,
            cert_path: cert_path.to_str().unwrap().to_string(),
            key_path: key_path.to_str().unwrap().to_string(),
            dir,
        }
    }

    /// A rustls client config that trusts only this CA.
    pub fn client_tls_config(&self) -> Arc<ClientConfig> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.add(self.cert_der.clone()).unwrap();
        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Arc::new(config)
    }
}

// ---------------------------------------------------------------------------
// TestProxy: ProxyServer on ephemeral ports with a temporary cache
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub cache_dir: TempDir,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestProxy {
    /// Start a proxy whose origin fetches all go to `upstream`.
    pub async fn start(ca: &TestCa, upstream: &str) -> Self {
        Self::start_with(ca, upstream, |_| {}).await
    }

    /// Like `start`, with a hook to adjust the config first.
    pub async fn start_with(ca: &TestCa, upstream: &str, configure: impl FnOnce(&mut Config)) -> Self {
        let cache_dir = tempfile::tempdir().unwrap();
        let mut config = Config::minimal(
            "127.0.0.1:0".to_string(),
            "127.0.0.1:0".to_string(),
            ca.cert_path.clone(),
            ca.key_path.clone(),
            cache_dir.path().to_path_buf(),
        );
        config.proxy.connect_probe = false;
        config.proxy.upstream_override = Some(upstream.to_string());
        config.logging.log_requests = false;
        config.cache.lock_poll_interval_ms = 20;
        configure(&mut config);

        let mut server = ProxyServer::new(config).unwrap();
        let addresses = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self {
            http_addr: addresses.http,
            https_addr: addresses.https.unwrap(),
            cache_dir,
            shutdown_tx,
        }
    }

    pub fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.path().join(key)
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Names of the files in the cache directory, sorted.
pub fn cache_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// A reqwest client that routes everything through the proxy and trusts the test CA.
pub fn test_client(proxy_addr: SocketAddr, ca: &TestCa) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr)).unwrap();
    let ca_cert = reqwest::tls::Certificate::from_pem(ca.cert_pem.as_bytes()).unwrap();

    reqwest::Client::builder()
        .proxy(proxy)
        .add_root_certificate(ca_cert)
        .build()
        .unwrap()
}

/// Open a CONNECT tunnel by hand and return the raw acknowledgment head
/// along with the still-open stream.
pub async fn raw_connect(proxy_addr: SocketAddr, authority: &str) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        authority, authority
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // Byte at a time so nothing after the head is consumed.
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "proxy closed before finishing CONNECT response");
        head.push(byte[0]);
    }
    (String::from_utf8(head).unwrap(), stream)
}

/// TLS handshake over an established tunnel, validating against the test CA.
pub async fn tls_over(stream: TcpStream, ca: &TestCa, hostname: &str) -> TlsStream<TcpStream> {
    let connector = TlsConnector::from(ca.client_tls_config());
    let name = ServerName::try_from(hostname.to_string()).unwrap();
    connector.connect(name, stream).await.unwrap()
}

/// Send one request over `stream` and read everything until the server closes.
pub async fn exchange<S>(stream: &mut S, request: &str) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}
