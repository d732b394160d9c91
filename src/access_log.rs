//! JSONL access log of cache decisions.

use serde::Serialize;
use std::path::Path;

/// What happened to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessEvent {
    CacheHit,
    CacheMiss,
    Passthrough,
    Error,
}

/// How the request reached the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Plaintext listener
    Http,
    /// TLS listener
    Https,
    /// Inside a CONNECT tunnel
    Tunnel,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessEntry {
    pub timestamp: String,
    pub event: AccessEvent,
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    pub transport: Transport,
    pub status: u16,
}

/// Returns the current UTC time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Appends one JSON object per line; failures are logged, never returned.
pub struct AccessLog {
    writer: std::sync::Mutex<std::io::BufWriter<std::fs::File>>,
}

impl AccessLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: std::sync::Mutex::new(std::io::BufWriter::new(file)),
        })
    }

    pub fn record(&self, entry: &AccessEntry) {
        use std::io::Write;
        let json = match serde_json::to_string(entry) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize access entry");
                return;
            }
        };

        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "Failed to lock access log writer");
                return;
            }
        };
        if let Err(e) = writeln!(writer, "{}", json).and_then(|_| writer.flush()) {
            tracing::error!(error = %e, "Failed to write access entry");
        }
    }
}
