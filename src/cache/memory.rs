//! Memory Tier
//!
//! Bounded in-process map with per-entry expiry. When full, the entry
//! closest to expiry is evicted to make room. Expired entries are dropped
//! lazily when a read or existence check finds them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use super::{Cache, CacheEntry, CacheError, CacheStats};

/// Default maximum number of entries
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Map plus the byte counter it must stay in sync with
#[derive(Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    bytes_used: u64,
}

impl Entries {
    fn insert(&mut self, entry: CacheEntry) {
        self.bytes_used += entry.value.len() as u64;
        if let Some(old) = self.map.insert(entry.key.clone(), entry) {
            self.bytes_used -= old.value.len() as u64;
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.map.remove(key)?;
        self.bytes_used -= removed.value.len() as u64;
        Some(removed)
    }

    /// Drop the entry with the soonest expiry
    fn evict_nearest_expiry(&mut self) -> Option<String> {
        let key = self
            .map
            .values()
            .min_by_key(|e| e.expires_at)
            .map(|e| e.key.clone())?;
        self.remove(&key);
        Some(key)
    }
}

/// In-memory cache tier
pub struct MemoryCache {
    entries: RwLock<Entries>,
    /// Maximum number of entries before eviction kicks in
    capacity: usize,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

impl MemoryCache {
    /// Create a memory tier with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a memory tier holding at most `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Snapshot of a stored entry, expired or not
    #[cfg(test)]
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().map.get(key).cloned()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let (items, bytes_used) = {
            let entries = self.entries.read();
            (entries.map.len(), entries.bytes_used)
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            items,
            bytes_used,
        }
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = format!("{:.1}%", stats.hit_rate()),
            items = stats.items,
            bytes_used = stats.bytes_used,
            "Memory cache metrics"
        );
    }

    /// Remove `key` if it is still expired under the write lock
    fn expire(&self, key: &str) {
        let now = Utc::now();
        let mut entries = self.entries.write();
        if entries.map.get(key).is_some_and(|e| !e.is_valid_at(now)) {
            entries.remove(key);
            trace!(key = key, "Dropped expired entry");
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let now = Utc::now();
        let expired = {
            let entries = self.entries.read();
            match entries.map.get(key) {
                Some(entry) if entry.is_valid_at(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(key = key, "Memory cache HIT");
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.expire(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key = key, "Memory cache MISS");
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry::new(key, value, ttl)?;
        let size = entry.value.len();

        let mut entries = self.entries.write();
        if !entries.map.contains_key(key) && entries.map.len() >= self.capacity {
            if let Some(evicted) = entries.evict_nearest_expiry() {
                debug!(key = %evicted, "Evicted entry nearest to expiry");
            }
        }
        entries.insert(entry);
        drop(entries);

        debug!(key = key, size = size, ttl_secs = ttl.as_secs(), "Cached value in memory");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        let now = Utc::now();
        let valid = match self.entries.read().map.get(key) {
            Some(entry) => entry.is_valid_at(now),
            None => return Ok(false),
        };
        if !valid {
            self.expire(key);
        }
        Ok(valid)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        *self.entries.write() = Entries::default();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!("Cleared memory cache");
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.clear().await
    }

    fn stats(&self) -> Option<CacheStats> {
        Some(MemoryCache::stats(self))
    }
}
