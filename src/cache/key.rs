//! URL normalization, cache key derivation and content classification

use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::Method;

use crate::hashing::sha1_hex;

/// Longest base name kept in a cache file name, in bytes.
const MAX_BASE_LEN: usize = 200;

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// What the cache needs to know about an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    pub method: Method,
    /// Host as the client named it, port included when present
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    /// The request arrived over a TLS session terminated by the proxy
    pub tls: bool,
    /// Value of `X-Forwarded-Proto`, lowercased, if it named http or https
    pub forwarded_proto: Option<String>,
}

impl CacheRequest {
    /// Build from a parsed request head.
    ///
    /// The host comes from an absolute-form URI when there is one, otherwise
    /// from the `Host` header, otherwise from `fallback_host`.
    pub fn from_parts(parts: &Parts, tls: bool, fallback_host: Option<&str>) -> Option<Self> {
        let host = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim().to_string())
            })
            .filter(|h| !h.is_empty())
            .or_else(|| fallback_host.map(str::to_string))?;

        let forwarded_proto = parts
            .headers
            .get(FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| v == "http" || v == "https");

        let path = match parts.uri.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        Some(Self {
            method: parts.method.clone(),
            host,
            path,
            query: parts.uri.query().filter(|q| !q.is_empty()).map(str::to_string),
            tls,
            forwarded_proto,
        })
    }

    /// `https` when the session was TLS or the host is a known secure origin;
    /// an explicit forwarded protocol overrides both.
    pub fn scheme(&self, secure_hosts: &[String]) -> &str {
        if let Some(proto) = self.forwarded_proto.as_deref() {
            return proto;
        }
        if self.tls || secure_hosts.iter().any(|h| self.host.contains(h.as_str())) {
            "https"
        } else {
            "http"
        }
    }

    pub fn full_url(&self, secure_hosts: &[String]) -> String {
        let mut url = format!("{}://{}{}", self.scheme(secure_hosts), self.host, self.path);
        if let Some(query) = &self.query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// File name under the cache directory for `full_url`.
///
/// RPMs, wheels and wheel metadata are stored under their bare file name so
/// mirrors of the same artifact share one entry. Everything else is prefixed
/// with the SHA-1 of the full URL. Keys never start with a dot; those names
/// belong to lock markers and partial downloads.
pub fn cache_key(full_url: &str) -> String {
    let (host, path) = split_url(full_url);
    let base = base_name(host, path);
    let artifact = path.ends_with(".rpm") || path.contains(".whl.metadata") || path.contains(".whl");

    if artifact && !base.starts_with('.') {
        base
    } else {
        format!("{}_{}", sha1_hex(full_url), base)
    }
}

/// Media type reported for a tunneled response, from the URL alone.
pub fn content_type_for(full_url: &str) -> &'static str {
    if full_url.contains("pypi.org/simple") {
        "text/html"
    } else if full_url.contains(".whl.metadata") {
        "text/plain; charset=UTF-8"
    } else {
        "application/octet-stream"
    }
}

/// Bytes of a body examined by [`sniff_content_type`]
pub const SNIFF_LEN: usize = 512;

const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

/// Media type for a stored body, from its first bytes.
///
/// Used where no origin headers are at hand. Recognizes HTML and XML
/// documents, zip and gzip archives and plain text; anything else is
/// `application/octet-stream`.
pub fn sniff_content_type(prefix: &[u8]) -> &'static str {
    let data = &prefix[..prefix.len().min(SNIFF_LEN)];
    let trimmed = match data.iter().position(|b| !b" \t\n\r\x0c".contains(b)) {
        Some(start) => &data[start..],
        None => &[][..],
    };

    let is_html = HTML_TAGS.iter().any(|tag| {
        trimmed.len() > tag.len()
            && trimmed[..tag.len()].eq_ignore_ascii_case(tag)
            && matches!(trimmed[tag.len()], b' ' | b'>')
    });
    if is_html {
        return "text/html; charset=utf-8";
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if data.starts_with(b"PK\x03\x04") {
        return "application/zip";
    }
    if data.starts_with(b"\x1f\x8b\x08") {
        return "application/x-gzip";
    }

    let binary = data
        .iter()
        .any(|&b| matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F));
    if binary {
        "application/octet-stream"
    } else {
        "text/plain; charset=utf-8"
    }
}

/// Split a normalized URL into its authority and its path (query dropped).
fn split_url(full_url: &str) -> (&str, &str) {
    let rest = full_url
        .split_once("://")
        .map_or(full_url, |(_, rest)| rest);
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    }
}

fn base_name(host: &str, path: &str) -> String {
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    match last {
        "" | "." | ".." => truncate(&host.replace(':', "_"), MAX_BASE_LEN).to_string(),
        name => truncate(name, MAX_BASE_LEN).to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn secure() -> Vec<String> {
        vec!["pypi.org".to_string(), "files.pythonhosted.org".to_string()]
    }

    fn parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method("GET").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn request(uri: &str, headers: &[(&str, &str)], tls: bool) -> CacheRequest {
        CacheRequest::from_parts(&parts(uri, headers), tls, None).unwrap()
    }

    #[test]
    fn test_rpm_key_is_base_name() {
        assert_eq!(
            cache_key("http://mirror.example/centos/x86_64/bash-5.1-1.el9.x86_64.rpm"),
            "bash-5.1-1.el9.x86_64.rpm"
        );
        assert_eq!(
            cache_key("https://other.example/pool/bash-5.1-1.el9.x86_64.rpm?token=abc"),
            "bash-5.1-1.el9.x86_64.rpm"
        );
    }

    #[test]
    fn test_wheel_and_metadata_keys_are_base_names() {
        assert_eq!(
            cache_key("https://files.pythonhosted.org/packages/x/foo-1.0-py3-none-any.whl"),
            "foo-1.0-py3-none-any.whl"
        );
        assert_eq!(
            cache_key("https://files.pythonhosted.org/packages/x/foo-1.0-py3-none-any.whl.metadata"),
            "foo-1.0-py3-none-any.whl.metadata"
        );
    }

    #[test]
    fn test_dot_names_are_hash_prefixed() {
        let url = "http://mirror.example/pool/.bash-5.1.rpm";
        assert_eq!(cache_key(url), format!("{}_.bash-5.1.rpm", sha1_hex(url)));

        let url = "http://mirror.example/foo.whl/.locks";
        assert!(!cache_key(url).starts_with('.'));
    }

    #[test]
    fn test_index_key_is_hash_prefixed() {
        let url = "http://example.org/simple/foo/";
        assert_eq!(cache_key(url), format!("{}_foo", sha1_hex(url)));
    }

    #[test]
    fn test_distinct_urls_same_base_get_distinct_keys() {
        let a = cache_key("https://pypi.org/simple/requests/");
        let b = cache_key("https://mirror.example/simple/requests/");
        assert_ne!(a, b);
        assert!(a.ends_with("_requests"));
        assert!(b.ends_with("_requests"));
    }

    #[test]
    fn test_root_path_falls_back_to_host() {
        let url = "http://example.org/";
        assert_eq!(cache_key(url), format!("{}_example.org", sha1_hex(url)));

        let with_port = "http://example.org:8080/";
        assert_eq!(
            cache_key(with_port),
            format!("{}_example.org_8080", sha1_hex(with_port))
        );
    }

    #[test]
    fn test_long_base_name_truncated() {
        let name = "a".repeat(400);
        let url = format!("http://example.org/{}", name);
        let key = cache_key(&url);
        assert_eq!(key.len(), 40 + 1 + MAX_BASE_LEN);
    }

    #[test]
    fn test_content_type_classification() {
        assert_eq!(content_type_for("https://pypi.org/simple/foo/"), "text/html");
        assert_eq!(
            content_type_for("https://files.pythonhosted.org/p/foo-1.0-py3-none-any.whl.metadata"),
            "text/plain; charset=UTF-8"
        );
        assert_eq!(
            content_type_for("https://files.pythonhosted.org/p/foo-1.0-py3-none-any.whl"),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for("http://mirror.example/bash.rpm"),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_sniffed_content_types() {
        assert_eq!(
            sniff_content_type(b"\n  <!DOCTYPE html>\n<html><body></body></html>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            sniff_content_type(b"<a href=\"/packages/foo.whl\">foo</a>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(sniff_content_type(b"<?xml version=\"1.0\"?><repomd/>"), "text/xml; charset=utf-8");
        assert_eq!(sniff_content_type(b"PK\x03\x04\x14\x00"), "application/zip");
        assert_eq!(sniff_content_type(b"\x1f\x8b\x08\x00"), "application/x-gzip");
        assert_eq!(
            sniff_content_type(b"Metadata-Version: 2.1\nName: foo\n"),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            sniff_content_type(b"\xed\xab\xee\xdb\x03\x00\x00\x00"),
            "application/octet-stream"
        );
        assert_eq!(sniff_content_type(b""), "text/plain; charset=utf-8");
    }

    #[test]
    fn test_absolute_form_request_is_http() {
        let req = request("http://example.org/simple/foo/", &[], false);
        assert_eq!(req.host, "example.org");
        assert_eq!(req.full_url(&secure()), "http://example.org/simple/foo/");
    }

    #[test]
    fn test_origin_form_uses_host_header() {
        let req = request("/simple/foo/?format=json", &[("host", "mirror.example:8080")], false);
        assert_eq!(
            req.full_url(&secure()),
            "http://mirror.example:8080/simple/foo/?format=json"
        );
    }

    #[test]
    fn test_fallback_host() {
        let req = CacheRequest::from_parts(&parts("/x.rpm", &[]), true, Some("mirror.example")).unwrap();
        assert_eq!(req.full_url(&secure()), "https://mirror.example/x.rpm");
        assert!(CacheRequest::from_parts(&parts("/x.rpm", &[]), true, None).is_none());
    }

    #[test]
    fn test_tls_session_is_https() {
        let req = request("/simple/foo/", &[("host", "mirror.example")], true);
        assert_eq!(req.scheme(&secure()), "https");
    }

    #[test]
    fn test_secure_host_is_https() {
        let req = request("http://pypi.org/simple/foo/", &[], false);
        assert_eq!(req.full_url(&secure()), "https://pypi.org/simple/foo/");
    }

    #[test]
    fn test_forwarded_proto_overrides_transport() {
        let req = request(
            "http://example.org/simple/foo/",
            &[("x-forwarded-proto", "HTTPS")],
            false,
        );
        assert_eq!(req.scheme(&secure()), "https");

        let req = request(
            "/simple/foo/",
            &[("host", "pypi.org"), ("x-forwarded-proto", "http")],
            true,
        );
        assert_eq!(req.scheme(&secure()), "http");
    }

    #[test]
    fn test_unknown_forwarded_proto_ignored() {
        let req = request(
            "http://example.org/",
            &[("x-forwarded-proto", "gopher")],
            false,
        );
        assert_eq!(req.forwarded_proto, None);
        assert_eq!(req.scheme(&secure()), "http");
    }
}
