//! Item detail cache
//!
//! Short-lived cache for single items fetched with their content blocks.
//! Uses Moka's synchronous cache; lookups never touch the network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tracing::{debug, trace};

use super::CacheStats;
use crate::notion::UpstreamItem;

/// Default number of item details kept
const DEFAULT_MAX_ITEMS: u64 = 1_000;

/// Cache of full item details keyed by item id
pub struct DetailCache {
    items: Cache<String, Arc<UpstreamItem>>,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

impl DetailCache {
    /// Create a detail cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ITEMS)
    }

    pub fn with_capacity(ttl: Duration, max_items: u64) -> Self {
        let items = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_items)
            .name("item_detail_cache")
            .build();

        Self {
            items,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get an item's details from cache
    pub fn get(&self, id: &str) -> Option<Arc<UpstreamItem>> {
        match self.items.get(id) {
            Some(item) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(id = id, "Cache HIT for item detail");
                Some(item)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(id = id, "Cache MISS for item detail");
                None
            }
        }
    }

    /// Insert an item's details
    pub fn insert(&self, item: UpstreamItem) -> Arc<UpstreamItem> {
        let blocks = item.content_blocks.len();
        let item = Arc::new(item);
        self.items.insert(item.id.clone(), item.clone());
        debug!(id = %item.id, blocks = blocks, "Cached item detail");
        item
    }

    /// Drop everything and reset counters
    pub fn clear(&self) {
        self.items.invalidate_all();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!("Cleared item detail cache");
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            items: self.items.entry_count() as usize,
            bytes_used: 0,
        }
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = format!("{:.1}%", stats.hit_rate()),
            entries = stats.items,
            "Item detail cache metrics"
        );
    }
}
