//! Per-key mutual exclusion, within the process and across processes.
//!
//! Tasks in one process serialize on an in-memory mutex per key, so only one
//! of them ever touches the filesystem marker. The marker (`.<content>.lock`)
//! is created atomically and guards against other processes sharing the same
//! cache directory. It records the owner's pid, a per-owner token and a
//! timestamp; the owner rewrites it while a fetch is in progress so waiters
//! can tell a live fetch from an abandoned one.

use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

use crate::error::{Error, Result};

struct Slot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters, cancelled waiters included until they drop
    users: usize,
}

/// Map of per-key async mutexes; entries live only while someone holds or
/// waits on them.
#[derive(Default)]
pub struct KeyLocks {
    map: Mutex<HashMap<String, Slot>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = {
            let mut map = self.map.lock().expect("other users should not panic");
            let slot = map.entry(key.to_string()).or_insert_with(|| Slot {
                mutex: Arc::default(),
                users: 0,
            });
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };
        // Registered before waiting so a cancelled wait still unregisters.
        let mut guard = KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }

    /// Number of keys currently locked or awaited
    pub fn active(&self) -> usize {
        self.map.lock().expect("other users should not panic").len()
    }
}

pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.map.lock().expect("other users should not panic");
        if let Some(slot) = map.get_mut(&self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// How long and how often to wait for a marker held elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct MarkerPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub stale_after: Duration,
}

/// A held lock marker; removed from disk when dropped, unless another
/// owner has reclaimed it in the meantime.
#[derive(Debug)]
pub struct LockMarker {
    path: PathBuf,
    token: u64,
}

impl LockMarker {
    /// `.<name>.lock` next to the content file. Cache keys never start with
    /// a dot, so markers cannot collide with content.
    pub fn path_for(content_path: &Path) -> PathBuf {
        hidden_sibling(content_path, ".lock")
    }

    /// Create the marker for `content_path`, waiting while another owner
    /// holds it. Markers not refreshed within `stale_after` are removed and
    /// the attempt repeated; after `timeout` the wait fails.
    pub async fn acquire(content_path: &Path, policy: MarkerPolicy) -> Result<Self> {
        let path = Self::path_for(content_path);
        let token = OsRng.next_u64();
        let started = Instant::now();
        let mut announced = false;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let marker = Self { path, token };
                    let written = async {
                        file.write_all(marker.stamp().as_bytes()).await?;
                        file.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        // Drop only removes markers carrying our stamp.
                        if let Err(rm) = tokio::fs::remove_file(&marker.path).await {
                            tracing::warn!(marker = %marker.path.display(), error = %rm, "Failed to remove lock marker");
                        }
                        return Err(e.into());
                    }
                    if announced {
                        tracing::debug!(
                            marker = %marker.path.display(),
                            waited_ms = started.elapsed().as_millis() as u64,
                            "Acquired lock marker after waiting"
                        );
                    }
                    return Ok(marker);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(Error::cache(format!(
                        "Failed to create lock marker '{}': {}",
                        path.display(),
                        e
                    )))
                }
            }

            if reclaim_if_stale(&path, policy.stale_after).await? {
                continue;
            }

            if started.elapsed() >= policy.timeout {
                return Err(Error::LockTimeout {
                    path,
                    waited: started.elapsed(),
                });
            }

            if !announced {
                tracing::debug!(marker = %path.display(), "Waiting for lock marker held elsewhere");
                announced = true;
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Rewrite the marker so waiters see the fetch is still alive. A marker
    /// that now names another owner is left untouched.
    pub async fn refresh(&self) {
        let result = async {
            let current = tokio::fs::read_to_string(&self.path).await?;
            if !self.owns(&current) {
                return Ok(false);
            }
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)
                .await?;
            file.write_all(self.stamp().as_bytes()).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(true)
        }
        .await;
        match result {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(marker = %self.path.display(), "Lock marker taken over by another owner")
            }
            Err(e) => {
                tracing::warn!(marker = %self.path.display(), error = %e, "Failed to refresh lock marker")
            }
        }
    }

    fn stamp(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        format!("{} {:016x} {}\n", std::process::id(), self.token, now)
    }

    /// Whether `contents` was written by this marker
    fn owns(&self, contents: &str) -> bool {
        let mut fields = contents.split_whitespace();
        fields.next() == Some(std::process::id().to_string().as_str())
            && fields.next() == Some(format!("{:016x}", self.token).as_str())
    }
}

impl Drop for LockMarker {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if self.owns(&contents) => {}
            Ok(_) => {
                tracing::debug!(marker = %self.path.display(), "Lock marker reclaimed elsewhere; leaving it");
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(marker = %self.path.display(), error = %e, "Failed to read lock marker");
                return;
            }
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(marker = %self.path.display(), error = %e, "Failed to remove lock marker")
            }
        }
    }
}

/// `.<file name><suffix>` in the same directory as `content_path`
pub(crate) fn hidden_sibling(content_path: &Path, suffix: &str) -> PathBuf {
    let name = content_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    content_path.with_file_name(format!(".{}{}", name, suffix))
}

/// Remove the marker if its last refresh is older than `stale_after`.
/// Returns true when the caller should retry immediately.
async fn reclaim_if_stale(path: &Path, stale_after: Duration) -> Result<bool> {
    let modified = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.modified()?,
        // Released between our create attempt and now.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };

    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age < stale_after {
        return Ok(false);
    }

    let owner = tokio::fs::read_to_string(path).await.unwrap_or_default();
    tracing::warn!(
        marker = %path.display(),
        age_secs = age.as_secs(),
        owner = %owner.trim(),
        "Reclaiming stale lock marker"
    );
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(Error::cache(format!(
            "Failed to remove stale lock marker '{}': {}",
            path.display(),
            e
        ))),
    }
}
