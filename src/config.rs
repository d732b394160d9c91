//! Configuration parsing and management

use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listener and tunnel settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// On-disk cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Leaf certificate issuance settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the tunnel answers the decrypted inner request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelResponseMode {
    /// `200 OK` plus a `Content-Type` classified from the URL
    #[default]
    Synthesized,
    /// Relay the origin's status and headers on a miss, like the plain path
    Origin,
}

/// Proxy-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Plaintext HTTP listener
    pub http_bind: String,

    /// TLS listener with per-SNI certificates; empty disables it
    pub https_bind: String,

    /// Path to the root CA certificate (PEM)
    pub ca_cert: String,

    /// Path to the root CA private key (PKCS#8 PEM, RSA or EC)
    pub ca_key: String,

    /// Dial the CONNECT target before acknowledging the tunnel
    pub connect_probe: bool,

    /// Timeout for the CONNECT reachability probe
    pub connect_timeout_secs: u64,

    /// Timeout for the client TLS handshake and inner request head
    pub handshake_timeout_secs: u64,

    /// Response style inside CONNECT tunnels
    pub tunnel_response: TunnelResponseMode,

    /// Send every origin fetch to this base URI instead (testing only)
    pub upstream_override: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_bind: "0.0.0.0:80".to_string(),
            https_bind: "0.0.0.0:443".to_string(),
            ca_cert: "/src/caCert.pem".to_string(),
            ca_key: "/src/caKey.pem".to_string(),
            connect_probe: true,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 30,
            tunnel_response: TunnelResponseMode::Synthesized,
            upstream_override: None,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// The TLS listener is optional; an empty address turns it off.
    pub fn https_enabled(&self) -> bool {
        !self.https_bind.trim().is_empty()
    }
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Flat directory holding content files and lock markers
    pub dir: PathBuf,

    /// Hosts always reached over https, matched by substring
    pub secure_hosts: Vec<String>,

    /// How often a waiter re-checks a held lock marker
    pub lock_poll_interval_ms: u64,

    /// Give up waiting for a lock marker after this long
    pub lock_timeout_secs: u64,

    /// A marker not refreshed for this long is considered abandoned
    pub stale_lock_secs: u64,

    /// Deadline for a whole origin fetch
    pub fetch_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/src/packages"),
            secure_hosts: vec!["pypi.org".to_string(), "files.pythonhosted.org".to_string()],
            lock_poll_interval_ms: 1000,
            lock_timeout_secs: 600,
            stale_lock_secs: 300,
            fetch_timeout_secs: 600,
        }
    }
}

impl CacheConfig {
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Leaf certificate configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Validity of every issued leaf certificate
    pub leaf_validity_hours: u64,

    /// Number of issued leaves kept for reuse; 0 issues a fresh leaf every time
    pub leaf_cache_capacity: usize,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            leaf_validity_hours: 24,
            leaf_cache_capacity: 0,
        }
    }
}

impl TlsConfig {
    pub fn leaf_validity(&self) -> Duration {
        Duration::from_secs(self.leaf_validity_hours * 60 * 60)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,

    /// Log one line per resolved request
    pub log_requests: bool,

    /// Optional JSONL access log path
    pub access_log: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_requests: true,
            access_log: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot: addresses, URIs and non-zero durations
    pub fn validate(&self) -> Result<()> {
        parse_bind("http_bind", &self.proxy.http_bind)?;
        if self.proxy.https_enabled() {
            parse_bind("https_bind", &self.proxy.https_bind)?;
        }

        let positive = [
            ("proxy.connect_timeout_secs", self.proxy.connect_timeout_secs),
            ("proxy.handshake_timeout_secs", self.proxy.handshake_timeout_secs),
            ("cache.lock_poll_interval_ms", self.cache.lock_poll_interval_ms),
            ("cache.lock_timeout_secs", self.cache.lock_timeout_secs),
            ("cache.stale_lock_secs", self.cache.stale_lock_secs),
            ("cache.fetch_timeout_secs", self.cache.fetch_timeout_secs),
            ("tls.leaf_validity_hours", self.tls.leaf_validity_hours),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }

        if let Some(ref raw) = self.proxy.upstream_override {
            upstream_override_uri(raw)?;
        }

        Ok(())
    }

    /// Build a config for tests and embedding: given binds, CA paths and cache dir
    pub fn minimal(
        http_bind: String,
        https_bind: String,
        ca_cert: String,
        ca_key: String,
        cache_dir: PathBuf,
    ) -> Self {
        let mut config = Config::default();
        config.proxy.http_bind = http_bind;
        config.proxy.https_bind = https_bind;
        config.proxy.ca_cert = ca_cert;
        config.proxy.ca_key = ca_key;
        config.cache.dir = cache_dir;
        config
    }
}

fn parse_bind(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::config(format!("Invalid {} '{}': {}", field, value, e)))
}

/// Parse and check `proxy.upstream_override`: scheme and authority only.
pub fn upstream_override_uri(raw: &str) -> Result<Uri> {
    let uri: Uri = raw
        .parse()
        .map_err(|e| Error::config(format!("Invalid upstream_override '{}': {}", raw, e)))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(Error::config(format!(
                "upstream_override '{}' must use http or https",
                raw
            )))
        }
    }
    if uri.authority().is_none() {
        return Err(Error::config(format!(
            "upstream_override '{}' has no host",
            raw
        )));
    }
    if !matches!(uri.path(), "" | "/") {
        return Err(Error::config(format!(
            "upstream_override '{}' must not carry a path",
            raw
        )));
    }
    Ok(uri)
}
