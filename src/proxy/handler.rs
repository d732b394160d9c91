//! Request dispatch: cached plain requests and CONNECT acknowledgment

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpStream;

use super::response::{error_response, file_body, full_body, ProxyBody};
use super::tunnel::TunnelHandler;
use crate::access_log::{now_rfc3339, AccessEntry, AccessEvent, AccessLog, Transport};
use crate::cache::{sniff_content_type, CacheRequest, CacheStore, Resolution, Resolved, SNIFF_LEN};
use crate::error::Error;

/// Emits the per-request log line and access log entry.
#[derive(Clone, Default)]
pub struct RequestLog {
    access_log: Option<Arc<AccessLog>>,
    log_requests: bool,
}

impl RequestLog {
    pub fn new(access_log: Option<Arc<AccessLog>>, log_requests: bool) -> Self {
        Self {
            access_log,
            log_requests,
        }
    }

    pub fn record(
        &self,
        transport: Transport,
        method: &Method,
        url: &str,
        cache_key: Option<&str>,
        event: AccessEvent,
        status: StatusCode,
    ) {
        if self.log_requests {
            let label = match event {
                AccessEvent::CacheHit => "HIT",
                AccessEvent::CacheMiss => "MISS",
                AccessEvent::Passthrough => "PASSTHROUGH",
                AccessEvent::Error => "ERROR",
            };
            tracing::info!(
                method = %method,
                url = %url,
                key = cache_key.unwrap_or("-"),
                transport = ?transport,
                status = status.as_u16(),
                "{}",
                label
            );
        }

        if let Some(ref log) = self.access_log {
            log.record(&AccessEntry {
                timestamp: now_rfc3339(),
                event,
                method: method.to_string(),
                url: url.to_string(),
                cache_key: cache_key.map(str::to_string),
                transport,
                status: status.as_u16(),
            });
        }
    }
}

/// Status for a failed resolve
pub(crate) fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        Error::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handles one request on either listener
#[derive(Clone)]
pub struct ProxyHandler {
    cache: Arc<CacheStore>,
    tunnel: Arc<TunnelHandler>,
    log: RequestLog,
    transport: Transport,
    connect_probe: Option<Duration>,
}

impl ProxyHandler {
    pub fn new(cache: Arc<CacheStore>, tunnel: Arc<TunnelHandler>, transport: Transport) -> Self {
        Self {
            cache,
            tunnel,
            log: RequestLog::default(),
            transport,
            connect_probe: None,
        }
    }

    pub fn with_request_log(mut self, log: RequestLog) -> Self {
        self.log = log;
        self
    }

    /// Dial the CONNECT target, within `timeout`, before acknowledging.
    pub fn with_connect_probe(mut self, timeout: Option<Duration>) -> Self {
        self.connect_probe = timeout;
        self
    }

    pub async fn handle(
        self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<ProxyBody>, hyper::Error> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req).await);
        }
        Ok(self.handle_plain(req).await)
    }

    async fn handle_connect(self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            tracing::warn!(uri = %req.uri(), "CONNECT without host:port target");
            return error_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
        };
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(443);

        tracing::debug!(host = %host, port = port, "CONNECT request");

        let probe = match self.connect_probe {
            Some(timeout) => match dial(&host, port, timeout).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!(host = %host, port = port, error = %e, "CONNECT target unreachable");
                    return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
                }
            },
            None => None,
        };

        let upgrade = hyper::upgrade::on(req);
        let tunnel = Arc::clone(&self.tunnel);
        tokio::spawn(async move {
            tunnel.run(upgrade, host, probe).await;
        });

        let mut response = Response::new(full_body(bytes::Bytes::new()));
        response
            .extensions_mut()
            .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    async fn handle_plain(self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (parts, _body) = req.into_parts();
        let tls = self.transport == Transport::Https;
        let Some(request) = CacheRequest::from_parts(&parts, tls, None) else {
            tracing::warn!(uri = %parts.uri, "Request without a host");
            return error_response(StatusCode::BAD_REQUEST, "request names no host");
        };

        match self.cache.resolve(&request).await {
            Ok(resolution) => self.respond(&request.method, resolution).await,
            Err(e) => {
                let url = self.cache.full_url(&request);
                tracing::error!(url = %url, error = %e, "Failed to resolve request");
                let status = error_status(&e);
                self.log
                    .record(self.transport, &request.method, &url, None, AccessEvent::Error, status);
                error_response(status, &e.to_string())
            }
        }
    }

    async fn respond(&self, method: &Method, resolution: Resolution) -> Response<ProxyBody> {
        let Resolution {
            full_url,
            cache_key,
            resolved,
        } = resolution;

        let (event, response) = match resolved {
            Resolved::Hit { path } => {
                let (file, len, content_type) = match open_cached_sniffed(&path).await {
                    Ok(opened) => opened,
                    Err(e) => return self.open_failed(method, &full_url, &cache_key, e),
                };
                let mut response = Response::new(file_body(file, full_url.clone()));
                let headers = response.headers_mut();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                (AccessEvent::CacheHit, response)
            }
            Resolved::Fetched { path, origin } => {
                let (file, len) = match open_cached(&path).await {
                    Ok(opened) => opened,
                    Err(e) => return self.open_failed(method, &full_url, &cache_key, e),
                };
                let mut response = Response::new(file_body(file, full_url.clone()));
                *response.status_mut() = origin.status;
                *response.headers_mut() = origin.headers;
                response
                    .headers_mut()
                    .entry(CONTENT_LENGTH)
                    .or_insert_with(|| HeaderValue::from(len));
                (AccessEvent::CacheMiss, response)
            }
            Resolved::Passthrough { origin, body } => {
                let len = body.len() as u64;
                let mut response = Response::new(full_body(body));
                *response.status_mut() = origin.status;
                *response.headers_mut() = origin.headers;
                response
                    .headers_mut()
                    .insert(CONTENT_LENGTH, HeaderValue::from(len));
                (AccessEvent::Passthrough, response)
            }
        };

        let status = response.status();
        self.log.record(
            self.transport,
            method,
            &full_url,
            Some(&cache_key),
            event,
            status,
        );
        response
    }

    fn open_failed(
        &self,
        method: &Method,
        url: &str,
        cache_key: &str,
        error: std::io::Error,
    ) -> Response<ProxyBody> {
        tracing::error!(url = %url, key = %cache_key, error = %error, "Failed to open cached file");
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        self.log
            .record(self.transport, method, url, Some(cache_key), AccessEvent::Error, status);
        error_response(status, "cached file unavailable")
    }
}

pub(crate) async fn open_cached(path: &std::path::Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}

/// Open a cached file and classify it by its leading bytes, leaving the
/// file positioned at the start.
async fn open_cached_sniffed(
    path: &std::path::Path,
) -> std::io::Result<(tokio::fs::File, u64, &'static str)> {
    let (mut file, len) = open_cached(path).await?;
    let mut prefix = vec![0u8; SNIFF_LEN.min(len as usize)];
    file.read_exact(&mut prefix).await?;
    file.rewind().await?;
    Ok((file, len, sniff_content_type(&prefix)))
}

async fn dial(host: &str, port: u16, timeout: Duration) -> crate::error::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::proxy(format!(
            "Failed to connect to {}:{}: {}",
            host, port, e
        ))),
        Err(_) => Err(Error::proxy(format!(
            "Timed out connecting to {}:{}",
            host, port
        ))),
    }
}
