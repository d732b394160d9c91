//! Error types for pkgproxy

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Main error type for the proxy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Timed out after {waited:?} waiting for lock marker {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        Error::Certificate(msg.into())
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Error::Proxy(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Error::Cache(msg.into())
    }

    /// Connection teardown noise that is not worth logging above debug.
    pub fn is_disconnect(&self) -> bool {
        let text = self.to_string();
        text.contains("connection closed")
            || text.contains("early eof")
            || text.contains("Broken pipe")
            || text.contains("Connection reset")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
