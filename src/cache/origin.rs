//! Upstream HTTP(S) client used on cache misses

use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::header::{HOST, LOCATION};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Redirects followed before a fetch is given up
const MAX_REDIRECTS: usize = 10;

/// Hop-by-hop headers that must not be relayed
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Status and headers of an origin response, hop-by-hop headers removed.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl OriginResponse {
    pub fn from_response<B>(response: &Response<B>) -> Self {
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        Self {
            status: response.status(),
            headers,
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Plain GET client for origin fetches, http and https alike.
#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    upstream_override: Option<Uri>,
}

impl std::fmt::Debug for OriginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginClient")
            .field("upstream_override", &self.upstream_override)
            .finish_non_exhaustive()
    }
}

impl OriginClient {
    /// Build a client trusting the webpki roots. With `upstream_override`
    /// every fetch goes to that base URI instead, keeping path and query.
    pub fn new(upstream_override: Option<Uri>) -> Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(format!("Failed to build origin TLS config: {}", e)))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(https),
            upstream_override,
        })
    }

    /// GET `full_url`, returning once the response head has arrived.
    ///
    /// Redirects are followed, up to ten of them; the final response is
    /// returned as if `full_url` had produced it.
    pub async fn get(&self, full_url: &str) -> Result<Response<Incoming>> {
        let mut uri: Uri = full_url
            .parse()
            .map_err(|e| Error::upstream(format!("Invalid origin URL '{}': {}", full_url, e)))?;

        for _ in 0..=MAX_REDIRECTS {
            let response = self.get_once(&uri).await?;
            if !is_followed_redirect(response.status()) {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Ok(response);
            };
            let next = resolve_location(&uri, location)?;
            tracing::debug!(
                url = %full_url,
                status = %response.status(),
                location = %next,
                "Following origin redirect"
            );
            uri = next;
        }

        Err(Error::upstream(format!(
            "Too many redirects fetching {}",
            full_url
        )))
    }

    async fn get_once(&self, uri: &Uri) -> Result<Response<Incoming>> {
        let mut builder = Request::builder().method(Method::GET);
        match &self.upstream_override {
            Some(base) => {
                let target = rebase(base, uri)?;
                tracing::debug!(url = %uri, target = %target, "Redirecting origin fetch");
                if let Some(authority) = uri.authority() {
                    builder = builder.header(HOST, authority.as_str());
                }
                builder = builder.uri(target);
            }
            None => builder = builder.uri(uri.clone()),
        }

        let request = builder
            .body(Empty::new())
            .map_err(|e| Error::upstream(format!("Failed to build origin request: {}", e)))?;

        self.client
            .request(request)
            .await
            .map_err(|e| Error::upstream(format!("Request to {} failed: {}", uri, e)))
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Target of a `Location` header, relative references resolved against `base`.
fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
    let invalid =
        |e: hyper::http::uri::InvalidUri| Error::upstream(format!("Invalid redirect '{}': {}", location, e));
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base.authority().map_or("", |a| a.as_str());

    let has_scheme = location
        .split_once("://")
        .is_some_and(|(s, _)| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)));

    let absolute = if let Some(rest) = location.strip_prefix("//") {
        format!("{}://{}", scheme, rest)
    } else if location.starts_with('/') {
        format!("{}://{}{}", scheme, authority, location)
    } else if has_scheme {
        location.to_string()
    } else {
        let dir = base.path().rsplit_once('/').map_or("", |(dir, _)| dir);
        format!("{}://{}{}/{}", scheme, authority, dir, location)
    };
    absolute.parse().map_err(invalid)
}

/// Swap scheme and authority of `uri` for those of `base`.
fn rebase(base: &Uri, uri: &Uri) -> Result<Uri> {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| Error::upstream(format!("Invalid origin path '{}': {}", path_and_query, e)))?,
    );
    Uri::from_parts(parts).map_err(|e| Error::upstream(format!("Invalid origin URL: {}", e)))
}
