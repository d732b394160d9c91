//! CONNECT tunnel handling with TLS MITM
//!
//! The tunnel terminates TLS with a leaf issued for the CONNECT host, reads a
//! single request from the decrypted stream, answers it from the cache and
//! closes. Nothing is relayed to the destination.

use bytes::{BufMut, BytesMut};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Method, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use super::codec::{read_request_head, MAX_HEAD_BYTES};
use super::handler::{error_status, open_cached, RequestLog};
use crate::access_log::{AccessEvent, Transport};
use crate::cache::{content_type_for, CacheRequest, CacheStore, Resolution, Resolved};
use crate::config::TunnelResponseMode;
use crate::error::{Error, Result};
use crate::tls::LeafIssuer;

/// Where a tunnel has got to; logged when it is torn down early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    AwaitConnect,
    DestinationDialed,
    HandshakeAckSent,
    Hijacked,
    TlsEstablished,
    InnerRequestParsed,
    CacheResolved,
    ResponseWritten,
    Closed,
}

struct Progress<'a> {
    host: &'a str,
    state: TunnelState,
}

impl Progress<'_> {
    fn advance(&mut self, next: TunnelState) {
        tracing::trace!(host = %self.host, from = ?self.state, to = ?next, "Tunnel state");
        self.state = next;
    }
}

/// Drives CONNECT tunnels after the acknowledgment has been sent
pub struct TunnelHandler {
    issuer: Arc<LeafIssuer>,
    cache: Arc<CacheStore>,
    mode: TunnelResponseMode,
    handshake_timeout: Duration,
    log: RequestLog,
}

impl TunnelHandler {
    pub fn new(issuer: Arc<LeafIssuer>, cache: Arc<CacheStore>) -> Self {
        Self {
            issuer,
            cache,
            mode: TunnelResponseMode::default(),
            handshake_timeout: Duration::from_secs(30),
            log: RequestLog::default(),
        }
    }

    pub fn with_response_mode(mut self, mode: TunnelResponseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_log(mut self, log: RequestLog) -> Self {
        self.log = log;
        self
    }

    /// Run a tunnel to completion. `probe` is the reachability connection
    /// to the destination, if one was made; it is held until the end.
    pub async fn run(&self, upgrade: OnUpgrade, host: String, probe: Option<TcpStream>) {
        let mut progress = Progress {
            host: &host,
            state: if probe.is_some() {
                TunnelState::DestinationDialed
            } else {
                TunnelState::AwaitConnect
            },
        };

        let result = match upgrade.await {
            Ok(upgraded) => {
                progress.advance(TunnelState::HandshakeAckSent);
                progress.advance(TunnelState::Hijacked);
                self.serve(TokioIo::new(upgraded), &mut progress).await
            }
            Err(e) => Err(Error::proxy(format!("Failed to upgrade connection: {}", e))),
        };

        if let Err(e) = result {
            if e.is_disconnect() {
                tracing::debug!(host = %host, state = ?progress.state, error = %e, "Tunnel closed by client");
            } else {
                tracing::warn!(host = %host, state = ?progress.state, error = %e, "Tunnel aborted");
            }
        }
        progress.advance(TunnelState::Closed);
        drop(probe);
    }

    async fn serve<S>(&self, upgraded: S, progress: &mut Progress<'_>) -> Result<()>
    where
        S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        let host = progress.host;
        let server_config = self.issuer.server_config_for_host(host)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let (mut reader, head) = tokio::time::timeout(self.handshake_timeout, async {
            let tls = acceptor
                .accept(upgraded)
                .await
                .map_err(|e| Error::tls(format!("Failed to accept TLS from client: {}", e)))?;
            progress.advance(TunnelState::TlsEstablished);
            let mut reader = BufReader::new(tls);
            let head = read_request_head(&mut reader, MAX_HEAD_BYTES).await?;
            Ok::<_, Error>((reader, head))
        })
        .await
        .map_err(|_| Error::tls(format!("Timed out negotiating tunnel for {}", host)))??;

        let Some(parts) = head else {
            tracing::debug!(host = %host, "Client closed tunnel without a request");
            return Ok(());
        };
        progress.advance(TunnelState::InnerRequestParsed);

        let request = CacheRequest::from_parts(&parts, true, Some(host))
            .ok_or_else(|| Error::proxy("Tunneled request names no host"))?;
        let resolution = match self.cache.resolve(&request).await {
            Ok(resolution) => resolution,
            Err(e) => {
                let url = self.cache.full_url(&request);
                self.log.record(
                    Transport::Tunnel,
                    &request.method,
                    &url,
                    None,
                    AccessEvent::Error,
                    error_status(&e),
                );
                return Err(e);
            }
        };
        progress.advance(TunnelState::CacheResolved);

        let stream = reader.get_mut();
        self.write_response(stream, &request.method, resolution).await?;
        progress.advance(TunnelState::ResponseWritten);

        stream.shutdown().await?;
        Ok(())
    }

    async fn write_response<W>(&self, stream: &mut W, method: &Method, resolution: Resolution) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Resolution {
            full_url,
            cache_key,
            resolved,
        } = resolution;
        let content_type = content_type_for(&full_url);

        let (event, status) = match resolved {
            Resolved::Hit { path } => {
                let (mut file, len) = open_cached(&path).await?;
                let head = match self.mode {
                    TunnelResponseMode::Synthesized => synthesized_head(content_type),
                    TunnelResponseMode::Origin => {
                        let mut headers = HeaderMap::new();
                        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                        relayed_head(StatusCode::OK, &headers)
                    }
                };
                stream.write_all(&head).await?;
                if *method != Method::HEAD {
                    tokio::io::copy(&mut file, &mut *stream).await?;
                }
                (AccessEvent::CacheHit, StatusCode::OK)
            }
            Resolved::Fetched { path, origin } => {
                let (mut file, len) = open_cached(&path).await?;
                let (head, status) = match self.mode {
                    TunnelResponseMode::Synthesized => (synthesized_head(content_type), StatusCode::OK),
                    TunnelResponseMode::Origin => {
                        let mut headers = origin.headers;
                        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                        (relayed_head(origin.status, &headers), origin.status)
                    }
                };
                stream.write_all(&head).await?;
                if *method != Method::HEAD {
                    tokio::io::copy(&mut file, &mut *stream).await?;
                }
                (AccessEvent::CacheMiss, status)
            }
            // Error pages keep their real status in both modes.
            Resolved::Passthrough { origin, body } => {
                let mut headers = origin.headers;
                headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
                stream.write_all(&relayed_head(origin.status, &headers)).await?;
                if *method != Method::HEAD {
                    stream.write_all(&body).await?;
                }
                (AccessEvent::Passthrough, origin.status)
            }
        };
        stream.flush().await?;

        self.log.record(
            Transport::Tunnel,
            method,
            &full_url,
            Some(&cache_key),
            event,
            status,
        );
        Ok(())
    }
}

/// `200 OK` with only a URL-derived content type; the body runs to close.
fn synthesized_head(content_type: &str) -> BytesMut {
    let mut head = BytesMut::with_capacity(64);
    head.put_slice(b"HTTP/1.1 200 OK\r\n");
    head.put_slice(b"Content-Type: ");
    head.put_slice(content_type.as_bytes());
    head.put_slice(b"\r\n\r\n");
    head
}

fn relayed_head(status: StatusCode, headers: &HeaderMap) -> BytesMut {
    let mut head = BytesMut::with_capacity(256);
    head.put_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in headers {
        head.put_slice(name.as_str().as_bytes());
        head.put_slice(b": ");
        head.put_slice(value.as_bytes());
        head.put_slice(b"\r\n");
    }
    head.put_slice(b"Connection: close\r\n\r\n");
    head
}
