//! Cache port consulted by result cursors, plus an in-memory implementation.

use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Generic get / set-with-TTL / tag-invalidation cache.
pub trait RecordCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[&str]);

    /// Drop every entry stored with `tag`.
    fn invalidate_tag(&self, tag: &str);
}

struct CachedValue {
    value: Vec<u8>,
    expires_at: Instant,
    tags: HashSet<String>,
}

/// Process-local cache backed by a concurrent map. Expired entries are
/// evicted lazily on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CachedValue>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RecordCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let expired = {
            let entry = self.entries.get(key)?;
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
            true
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[&str]) {
        self.entries.insert(
            key.to_string(),
            CachedValue {
                value,
                expires_at: Instant::now() + ttl,
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
        );
    }

    fn invalidate_tag(&self, tag: &str) {
        self.entries.retain(|_, v| !v.tags.contains(tag));
    }
}
