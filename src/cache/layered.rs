//! Layered Cache
//!
//! Composes a fast tier (L1) over a durable tier (L2). Reads try L1 first,
//! then L2, promoting L2 hits into L1 for `promote_ttl` or the record's
//! remaining lifetime, whichever is shorter. Writes go to both tiers; only an
//! L1 failure fails the write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Cache, CacheError, CacheStats};

pub struct LayeredCache {
    l1: Arc<dyn Cache>,
    l2: Arc<dyn Cache>,
    /// Lifetime given to values promoted from L2 into L1
    promote_ttl: Duration,
}

impl LayeredCache {
    pub fn new(l1: Arc<dyn Cache>, l2: Arc<dyn Cache>, promote_ttl: Duration) -> Self {
        Self {
            l1,
            l2,
            promote_ttl,
        }
    }
}

/// First error wins, but every tier is attempted
fn first_err(l1: Result<(), CacheError>, l2: Result<(), CacheError>) -> Result<(), CacheError> {
    l1.and(l2)
}

#[async_trait]
impl Cache for LayeredCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        if let Some(value) = self.l1.get(key).await? {
            return Ok(Some(value));
        }

        let Some((value, expires_at)) = self.l2.get_with_expiry(key).await? else {
            return Ok(None);
        };

        // The memory copy must not outlive the durable record
        let ttl = match expires_at {
            Some(expires_at) => match (expires_at - Utc::now()).to_std() {
                Ok(remaining) => remaining.min(self.promote_ttl),
                Err(_) => Duration::ZERO,
            },
            None => self.promote_ttl,
        };
        if ttl.is_zero() {
            return Ok(Some(value));
        }

        match self.l1.set(key, value.clone(), ttl).await {
            Ok(()) => debug!(
                key = key,
                ttl_secs = ttl.as_secs_f64(),
                "Promoted durable entry into memory"
            ),
            Err(e) => warn!(key = key, error = %e, "Failed to promote durable entry"),
        }
        Ok(Some(value))
    }

    async fn get_with_expiry(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Option<DateTime<Utc>>)>, CacheError> {
        Ok(self.get(key).await?.map(|value| (value, None)))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.l1.set(key, value.clone(), ttl).await?;
        if let Err(e) = self.l2.set(key, value, ttl).await {
            warn!(key = key, error = %e, "Durable cache write failed; memory copy kept");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let l1 = self.l1.delete(key).await;
        let l2 = self.l2.delete(key).await;
        first_err(l1, l2)
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        match self.l1.has(key).await {
            Ok(true) => Ok(true),
            Ok(false) => self.l2.has(key).await,
            Err(e) => {
                debug!(key = key, error = %e, "Memory tier check failed, asking durable tier");
                self.l2.has(key).await
            }
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let l1 = self.l1.clear().await;
        let l2 = self.l2.clear().await;
        first_err(l1, l2)
    }

    async fn close(&self) -> Result<(), CacheError> {
        let l1 = self.l1.close().await;
        let l2 = self.l2.close().await;
        first_err(l1, l2)
    }

    /// Memory-tier statistics
    fn stats(&self) -> Option<CacheStats> {
        self.l1.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DurableCache, MemoryCache};
    use tempfile::TempDir;

    /// A tier whose writes always fail
    struct FailingTier;

    #[async_trait]
    impl Cache for FailingTier {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::InvalidTtl)
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::InvalidTtl)
        }
        async fn has(&self, _key: &str) -> Result<bool, CacheError> {
            Ok(false)
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    fn tiers() -> (TempDir, Arc<MemoryCache>, Arc<DurableCache>) {
        let dir = TempDir::new().unwrap();
        let l2 = Arc::new(DurableCache::new(dir.path()).unwrap());
        (dir, Arc::new(MemoryCache::new()), l2)
    }

    #[tokio::test]
    async fn test_promotes_durable_hit_into_memory() {
        let (_dir, l1, l2) = tiers();
        let cache = LayeredCache::new(l1.clone(), l2.clone(), Duration::from_secs(300));

        l2.set("k", Bytes::from_static(b"v"), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(l1.entry("k").is_none());

        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        let promoted = l1.entry("k").unwrap();
        let lifetime = promoted.expires_at - promoted.created_at;
        assert_eq!(lifetime, chrono::Duration::seconds(300));
    }

    #[tokio::test]
    async fn test_promotion_never_outlives_durable_record() {
        let (_dir, l1, l2) = tiers();
        let cache = LayeredCache::new(l1.clone(), l2.clone(), Duration::from_secs(300));

        l2.set("k", Bytes::from_static(b"v"), Duration::from_secs(2))
            .await
            .unwrap();
        let durable_expiry = l2.get_with_expiry("k").await.unwrap().unwrap().1.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        let promoted = l1.entry("k").unwrap();
        assert!(promoted.expires_at <= durable_expiry);
        assert!(promoted.expires_at - promoted.created_at <= chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_write_through_both_tiers() {
        let (_dir, l1, l2) = tiers();
        let cache = LayeredCache::new(l1.clone(), l2.clone(), Duration::from_secs(300));

        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(l1.has("k").await.unwrap());
        assert!(l2.has("k").await.unwrap());

        cache.delete("k").await.unwrap();
        assert!(!cache.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_expiry_falls_through_to_durable() {
        let (_dir, l1, l2) = tiers();
        let cache = LayeredCache::new(l1.clone(), l2.clone(), Duration::from_millis(40));

        l1.set("k", Bytes::from_static(b"v"), Duration::from_millis(20))
            .await
            .unwrap();
        l2.set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.has("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert!(l1.entry("k").is_some());
    }

    #[tokio::test]
    async fn test_durable_write_failure_is_tolerated() {
        let l1 = Arc::new(MemoryCache::new());
        let cache = LayeredCache::new(l1.clone(), Arc::new(FailingTier), Duration::from_secs(300));

        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        // Delete reports the durable tier's failure after clearing memory
        assert!(cache.delete("k").await.is_err());
        assert!(l1.entry("k").is_none());
    }

    #[tokio::test]
    async fn test_memory_write_failure_fails_the_write() {
        let (_dir, _l1, l2) = tiers();
        let cache = LayeredCache::new(Arc::new(FailingTier), l2.clone(), Duration::from_secs(300));

        assert!(cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .is_err());
        assert!(!l2.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_empties_both() {
        let (_dir, l1, l2) = tiers();
        let cache = LayeredCache::new(l1.clone(), l2.clone(), Duration::from_secs(300));
        cache.set("a", Bytes::from_static(b"1"), Duration::from_secs(60)).await.unwrap();

        cache.clear().await.unwrap();
        assert!(!l1.has("a").await.unwrap());
        assert!(!l2.has("a").await.unwrap());
        assert_eq!(cache.stats().map(|s| s.items), Some(0));
        cache.close().await.unwrap();
    }
}
