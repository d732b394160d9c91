//! Bounded reuse of issued leaves

use lru::LruCache;
use rustls::sign::CertifiedKey;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct CacheEntry {
    key: Arc<CertifiedKey>,
    created_at: Instant,
}

/// LRU cache of signed leaves keyed by hostname.
///
/// Entries older than `ttl` are treated as absent and dropped on lookup.
pub struct LeafCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl LeafCache {
    /// Returns `None` for a zero capacity, meaning leaves are never reused.
    pub fn new(capacity: usize, ttl: Duration) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        })
    }

    pub fn get(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        let mut cache = self.cache.lock().expect("other users should not panic");

        if let Some(entry) = cache.get(hostname) {
            if entry.created_at.elapsed() < self.ttl {
                return Some(Arc::clone(&entry.key));
            }
            cache.pop(hostname);
        }

        None
    }

    pub fn put(&self, hostname: String, key: Arc<CertifiedKey>) {
        self.cache
            .lock()
            .expect("other users should not panic")
            .put(
                hostname,
                CacheEntry {
                    key,
                    created_at: Instant::now(),
                },
            );
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("other users should not panic").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
