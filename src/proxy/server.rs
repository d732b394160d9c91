//! Listeners: plaintext HTTP proxy and SNI-terminated TLS

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use super::handler::{ProxyHandler, RequestLog};
use super::tunnel::TunnelHandler;
use crate::access_log::{AccessLog, Transport};
use crate::cache::CacheStore;
use crate::config::{upstream_override_uri, Config};
use crate::error::{Error, Result};
use crate::tls::{CertificateAuthority, LeafIssuer};

/// Addresses the listeners ended up on after `bind()`
#[derive(Debug, Clone, Copy)]
pub struct BoundAddresses {
    pub http: SocketAddr,
    pub https: Option<SocketAddr>,
}

/// The proxy server: both listeners and the shared cache and issuer
pub struct ProxyServer {
    config: Config,
    cache: Arc<CacheStore>,
    issuer: Arc<LeafIssuer>,
    access_log: Option<Arc<AccessLog>>,
    http_listener: Option<TcpListener>,
    https_listener: Option<TcpListener>,
}

impl ProxyServer {
    /// Create a server from configuration, loading the CA from its files
    pub fn new(config: Config) -> Result<Self> {
        let ca = CertificateAuthority::from_files(&config.proxy.ca_cert, &config.proxy.ca_key)?;
        Self::with_ca(config, Arc::new(ca))
    }

    /// Create a server around an already loaded CA
    pub fn with_ca(config: Config, ca: Arc<CertificateAuthority>) -> Result<Self> {
        config.validate()?;

        let upstream_override = config
            .proxy
            .upstream_override
            .as_deref()
            .map(upstream_override_uri)
            .transpose()?;
        if let Some(ref uri) = upstream_override {
            tracing::warn!(target_uri = %uri, "All origin fetches redirected by upstream_override");
        }

        let cache = Arc::new(CacheStore::new(&config.cache, upstream_override)?);
        let issuer = Arc::new(LeafIssuer::new(ca, &config.tls));

        let access_log = match &config.logging.access_log {
            Some(path) => Some(Arc::new(AccessLog::open(path).map_err(|e| {
                Error::config(format!("Failed to open access log '{}': {}", path, e))
            })?)),
            None => None,
        };

        tracing::info!(
            cache_dir = %config.cache.dir.display(),
            tunnel_response = ?config.proxy.tunnel_response,
            connect_probe = config.proxy.connect_probe,
            "Proxy initialized"
        );

        Ok(Self {
            config,
            cache,
            issuer,
            access_log,
            http_listener: None,
            https_listener: None,
        })
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let addresses = self.bind().await?;
        tracing::info!(address = %addresses.http, "HTTP proxy listening");
        if let Some(https) = addresses.https {
            tracing::info!(address = %https, "TLS listener ready");
        }
        self.serve(shutdown).await
    }

    /// Bind both listeners and report the actual addresses.
    ///
    /// Useful when binding to port 0. Call `serve()` afterwards.
    pub async fn bind(&mut self) -> Result<BoundAddresses> {
        let (http_listener, http) = bind_tcp(&self.config.proxy.http_bind).await?;
        self.http_listener = Some(http_listener);

        let https = if self.config.proxy.https_enabled() {
            let (listener, addr) = bind_tcp(&self.config.proxy.https_bind).await?;
            self.https_listener = Some(listener);
            Some(addr)
        } else {
            None
        };

        Ok(BoundAddresses { http, https })
    }

    /// Serve connections on the bound listeners until `shutdown` fires.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let http_listener = self
            .http_listener
            .take()
            .ok_or_else(|| Error::proxy("bind() must be called before serve()"))?;
        let https_listener = self.https_listener.take();

        let log = RequestLog::new(self.access_log.clone(), self.config.logging.log_requests);
        let tunnel = Arc::new(
            TunnelHandler::new(Arc::clone(&self.issuer), Arc::clone(&self.cache))
                .with_response_mode(self.config.proxy.tunnel_response)
                .with_handshake_timeout(self.config.proxy.handshake_timeout())
                .with_request_log(log.clone()),
        );
        let probe = self
            .config
            .proxy
            .connect_probe
            .then(|| self.config.proxy.connect_timeout());

        let handler_for = |transport| {
            ProxyHandler::new(Arc::clone(&self.cache), Arc::clone(&tunnel), transport)
                .with_request_log(log.clone())
                .with_connect_probe(probe)
        };
        let http_handler = handler_for(Transport::Http);
        let https_handler = handler_for(Transport::Https);
        let acceptor = TlsAcceptor::from(Arc::new(self.issuer.sni_server_config()));
        let handshake_timeout = self.config.proxy.handshake_timeout();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                result = http_listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    tracing::debug!(client = %client_addr, "New connection");
                    // No automatic Date: the CONNECT acknowledgment is the bare status line.
                    spawn_connection(stream, client_addr, http_handler.clone(), false);
                }
                result = accept_optional(https_listener.as_ref()) => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept TLS connection");
                            continue;
                        }
                    };
                    tracing::debug!(client = %client_addr, "New TLS connection");
                    spawn_tls_connection(
                        stream,
                        client_addr,
                        acceptor.clone(),
                        handshake_timeout,
                        https_handler.clone(),
                    );
                }
            }
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn issuer(&self) -> &Arc<LeafIssuer> {
        &self.issuer
    }
}

async fn bind_tcp(address: &str) -> Result<(TcpListener, SocketAddr)> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| Error::config(format!("Invalid bind address '{}': {}", address, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", addr, e)))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))?;
    Ok((listener, local_addr))
}

async fn accept_optional(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

fn spawn_connection<S>(stream: S, client_addr: SocketAddr, handler: ProxyHandler, date_header: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| handler.clone().handle(req));

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .auto_date_header(date_header)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            let e = Error::from(e);
            if !e.is_disconnect() {
                tracing::debug!(client = %client_addr, error = %e, "Connection error");
            }
        }
    });
}

fn spawn_tls_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    handler: ProxyHandler,
) {
    tokio::spawn(async move {
        match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => {
                let sni = tls.get_ref().1.server_name().map(str::to_string);
                tracing::debug!(client = %client_addr, sni = ?sni, "TLS handshake complete");
                spawn_connection(tls, client_addr, handler, true);
            }
            Ok(Err(e)) => {
                tracing::debug!(client = %client_addr, error = %e, "TLS handshake failed");
            }
            Err(_) => {
                tracing::debug!(client = %client_addr, "TLS handshake timed out");
            }
        }
    });
}
