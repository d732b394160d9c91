//! On-disk package cache
//!
//! A request URL maps to one file in a flat directory. The first caller for a
//! missing file fetches it from the origin while everyone else asking for the
//! same key waits; later callers are served straight from disk.

mod key;
mod lock;
mod origin;

pub use key::{cache_key, content_type_for, sniff_content_type, CacheRequest, SNIFF_LEN};
pub use lock::{KeyLocks, LockMarker, MarkerPolicy};
pub use origin::{OriginClient, OriginResponse};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::Uri;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout_at, Instant};

use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Where a request's bytes come from
#[derive(Debug)]
pub enum Resolved {
    /// Already on disk; no origin metadata
    Hit { path: PathBuf },
    /// Fetched just now and committed to disk
    Fetched { path: PathBuf, origin: OriginResponse },
    /// Origin answered with a non-success status; relayed, never cached
    Passthrough { origin: OriginResponse, body: Bytes },
}

/// Outcome of [`CacheStore::resolve`]
#[derive(Debug)]
pub struct Resolution {
    pub full_url: String,
    pub cache_key: String,
    pub resolved: Resolved,
}

pub struct CacheStore {
    dir: PathBuf,
    secure_hosts: Vec<String>,
    locks: KeyLocks,
    marker_policy: MarkerPolicy,
    fetch_timeout: Duration,
    origin: OriginClient,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("dir", &self.dir)
            .field("active_keys", &self.locks.active())
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    pub fn new(config: &CacheConfig, upstream_override: Option<Uri>) -> Result<Self> {
        Ok(Self {
            dir: config.dir.clone(),
            secure_hosts: config.secure_hosts.clone(),
            locks: KeyLocks::new(),
            marker_policy: MarkerPolicy {
                poll_interval: config.lock_poll_interval(),
                timeout: config.lock_timeout(),
                stale_after: config.stale_lock_after(),
            },
            fetch_timeout: config.fetch_timeout(),
            origin: OriginClient::new(upstream_override)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn full_url(&self, request: &CacheRequest) -> String {
        request.full_url(&self.secure_hosts)
    }

    pub fn content_path(&self, cache_key: &str) -> PathBuf {
        self.dir.join(cache_key)
    }

    /// Find or fetch the bytes for `request`.
    ///
    /// At most one fetch per key runs at a time, both within this process
    /// and across processes sharing the directory.
    pub async fn resolve(&self, request: &CacheRequest) -> Result<Resolution> {
        let full_url = self.full_url(request);
        let cache_key = cache_key(&full_url);
        let path = self.content_path(&cache_key);

        let resolved = self.resolve_path(&full_url, &cache_key, path).await?;
        Ok(Resolution {
            full_url,
            cache_key,
            resolved,
        })
    }

    async fn resolve_path(&self, full_url: &str, key: &str, path: PathBuf) -> Result<Resolved> {
        if is_cached(&path).await {
            return Ok(Resolved::Hit { path });
        }

        let _key_guard = self.locks.lock(key).await;
        if is_cached(&path).await {
            tracing::debug!(key = %key, "Fetched by another task while waiting");
            return Ok(Resolved::Hit { path });
        }

        let marker = LockMarker::acquire(&path, self.marker_policy).await?;
        if is_cached(&path).await {
            tracing::debug!(key = %key, "Fetched by another process while waiting");
            return Ok(Resolved::Hit { path });
        }

        // Keep the marker fresh for as long as the fetch runs, including
        // while the origin is silent.
        let fetch = self.fetch(full_url, path, &marker);
        tokio::pin!(fetch);
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_period(),
            self.heartbeat_period(),
        );
        loop {
            tokio::select! {
                result = &mut fetch => return result,
                _ = heartbeat.tick() => marker.refresh().await,
            }
        }
    }

    fn heartbeat_period(&self) -> Duration {
        (self.marker_policy.stale_after / 3).max(Duration::from_millis(10))
    }

    async fn fetch(&self, full_url: &str, path: PathBuf, marker: &LockMarker) -> Result<Resolved> {
        let deadline = Instant::now() + self.fetch_timeout;
        tracing::debug!(url = %full_url, "Fetching from origin");

        let response = timeout_at(deadline, self.origin.get(full_url))
            .await
            .map_err(|_| Error::upstream(format!("Timed out waiting for {}", full_url)))??;
        let origin = OriginResponse::from_response(&response);

        if !origin.status.is_success() {
            let body = timeout_at(deadline, response.into_body().collect())
                .await
                .map_err(|_| Error::upstream(format!("Timed out reading {}", full_url)))?
                .map_err(|e| Error::upstream(format!("Failed to read {}: {}", full_url, e)))?
                .to_bytes();
            tracing::debug!(url = %full_url, status = %origin.status, "Origin error not cached");
            return Ok(Resolved::Passthrough { origin, body });
        }

        let part = part_path(&path, marker.token());
        match self
            .write_body(full_url, response.into_body(), &part, deadline)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&part).await {
                    tracing::debug!(path = %part.display(), error = %rm, "Could not remove partial file");
                }
                return Err(e);
            }
        }

        tokio::fs::rename(&part, &path).await.map_err(|e| {
            Error::cache(format!("Failed to commit '{}': {}", path.display(), e))
        })?;
        Ok(Resolved::Fetched { path, origin })
    }

    async fn write_body(
        &self,
        full_url: &str,
        mut body: hyper::body::Incoming,
        part: &Path,
        deadline: Instant,
    ) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(part)
            .await
            .map_err(|e| Error::cache(format!("Failed to create '{}': {}", part.display(), e)))?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        loop {
            let frame = timeout_at(deadline, body.frame())
                .await
                .map_err(|_| Error::upstream(format!("Timed out reading {}", full_url)))?;
            let frame = match frame {
                None => break,
                Some(frame) => frame
                    .map_err(|e| Error::upstream(format!("Failed to read {}: {}", full_url, e)))?,
            };
            if let Ok(data) = frame.into_data() {
                file.write_all(&data).await?;
                hasher.update(&data);
                written += data.len() as u64;
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        tracing::debug!(
            url = %full_url,
            bytes = written,
            sha256 = %hex::encode(hasher.finalize()),
            "Stored origin body"
        );
        Ok(())
    }
}

async fn is_cached(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// `.<name>.<owner token>.part`: hidden like the marker and unique per owner.
fn part_path(content_path: &Path, token: u64) -> PathBuf {
    lock::hidden_sibling(content_path, &format!(".{:016x}.part", token))
}
