//! Short-lived per-path result cache.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/// Default time-to-live for cached reads.
pub const DEFAULT_TTL: Duration = Duration::from_millis(1000);

/// One cached lookup. Failures are cached as `None`.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Option<String>,
    stored_at: Instant,
}

/// Path-keyed cache with passive expiry.
///
/// Entries are replaced, never mutated, and are only checked for age on read.
/// Writes are last-write-wins per path.
pub struct AccessCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl AccessCache {
    /// Creates an empty cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Looks up a fresh entry.
    ///
    /// The outer `Option` is the hit/miss, the inner one the cached value.
    pub fn get(&self, path: &str) -> Option<Option<String>> {
        let entries = self.entries.read();
        let entry = entries.get(path)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Stores a result for `path`, replacing any previous entry.
    pub fn put(&self, path: &str, value: Option<String>) {
        self.entries.write().insert(
            path.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for AccessCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
