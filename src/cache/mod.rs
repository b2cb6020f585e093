//! Caching layer
//!
//! Two tiers behind one contract: an in-process memory tier (L1) and a
//! file-backed durable tier (L2), composed by [`LayeredCache`]. Item details
//! fetched on demand live in a separate short-lived [`DetailCache`].

pub mod detail;
pub mod durable;
pub mod layered;
pub mod memory;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub use detail::DetailCache;
pub use durable::DurableCache;
pub use layered::LayeredCache;
pub use memory::MemoryCache;

/// Cache key holding the serialized "resource" collection
pub const RESOURCES_KEY: &str = "catalog:resources";

/// Cache key holding the serialized "prompt" collection
pub const PROMPTS_KEY: &str = "catalog:prompts";

/// Cache error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Failed to create cache directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt cache record {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode cache record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Cache TTL must be greater than zero")]
    InvalidTtl,

    #[error("Cache worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The contract every cache tier implements.
///
/// Implementations serialize concurrent access internally; callers never
/// lock around these calls. A missing or expired key is `Ok(None)`, not an
/// error.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a valid entry's value
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Fetch a valid entry's value together with its expiry, when the tier
    /// tracks one
    async fn get_with_expiry(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Option<DateTime<Utc>>)>, CacheError> {
        Ok(self.get(key).await?.map(|value| (value, None)))
    }

    /// Store a value that expires after `ttl`
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a key; removing a missing key succeeds
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Whether a valid entry exists
    async fn has(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove every entry
    async fn clear(&self) -> Result<(), CacheError>;

    /// Release resources held by the tier
    async fn close(&self) -> Result<(), CacheError>;

    /// Hit/miss and size counters, for tiers that keep them
    fn stats(&self) -> Option<CacheStats> {
        None
    }
}

/// A stored value with its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create an entry starting now.
    ///
    /// A zero TTL would make `expires_at == created_at` and is rejected.
    pub fn new(key: &str, value: Bytes, ttl: Duration) -> Result<Self, CacheError> {
        let created_at = Utc::now();
        Ok(Self {
            key: key.to_string(),
            value,
            created_at,
            expires_at: expiry_from(created_at, ttl)?,
        })
    }

    /// Valid iff `now < expires_at`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Compute `start + ttl`, saturating on overflow
pub(crate) fn expiry_from(
    start: DateTime<Utc>,
    ttl: Duration,
) -> Result<DateTime<Utc>, CacheError> {
    if ttl.is_zero() {
        return Err(CacheError::InvalidTtl);
    }
    let expires_at = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| start.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Ok(expires_at)
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub items: usize,
    pub bytes_used: u64,
}

impl CacheStats {
    /// Hit rate as a percentage of all lookups
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            (self.hits as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// SHA-256 digest of a cached payload, used for change detection only
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({self})")
    }
}
