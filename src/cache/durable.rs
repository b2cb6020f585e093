//! Durable Tier
//!
//! One file per key under a cache directory. Each file holds a JSON record
//! `{"value": <base64>, "expires_at": <RFC 3339>}`. Writes go through a temp
//! file in the same directory and are renamed into place, so a reader never
//! sees a half-written record.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{expiry_from, Cache, CacheError};

const RECORD_EXT: &str = "cache";
const TEMP_SUFFIX: &str = ".tmp";

/// Longest readable key prefix kept in a file name
const MAX_STEM_LEN: usize = 64;

/// On-disk record
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    #[serde(with = "base64_bytes")]
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// File-backed cache tier
pub struct DurableCache {
    /// Root directory for record files
    dir: PathBuf,
}

impl DurableCache {
    /// Open (creating if needed) a durable tier rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CacheError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let cache = Self { dir };

        // Temp files left behind by an interrupted write
        cache.cleanup();

        info!(cache_dir = %cache.dir.display(), "Durable cache initialized");
        Ok(cache)
    }

    /// Platform cache directory for this daemon
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("notion-cache")
    }

    /// Get the cache directory path
    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove stale temp files
    pub fn cleanup(&self) {
        let stale = match self.files_matching(|name| name.ends_with(TEMP_SUFFIX)) {
            Ok(stale) => stale,
            Err(e) => {
                warn!(
                    cache_dir = %self.dir.display(),
                    error = %e,
                    "Failed to scan for stale temp files"
                );
                return;
            }
        };
        for path in stale {
            debug!(path = %path.display(), "Removing stale temp file");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove stale temp file");
            }
        }
    }

    /// Map a key to its record file.
    ///
    /// The readable stem keeps only `[A-Za-z0-9_-]`; the hash suffix keeps
    /// distinct keys from colliding after sanitizing. Keys like `../x` can
    /// never leave the cache directory.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let stem: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_STEM_LEN)
            .collect();
        let hash = hex::encode(&Sha256::digest(key.as_bytes())[..8]);
        self.dir.join(format!("{stem}-{hash}.{RECORD_EXT}"))
    }

    fn files_matching(&self, keep: impl Fn(&str) -> bool) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| keep(name))
            {
                files.push(path);
            }
        }
        Ok(files)
    }

    async fn read_record(&self, key: &str) -> Result<Option<(PathBuf, Record)>, CacheError> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        match serde_json::from_slice::<Record>(&raw) {
            Ok(record) => Ok(Some((path, record))),
            Err(source) => {
                warn!(
                    key = key,
                    path = %path.display(),
                    error = %source,
                    "Removing corrupt cache record"
                );
                remove_if_present(&path).await?;
                Err(CacheError::Decode { path, source })
            }
        }
    }
}

async fn remove_if_present(path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write `data` to `path` atomically via a temp file in the same directory
fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<(), CacheError> {
    let io_err = |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(io_err)?;
    tmp.write_all(data).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[async_trait]
impl Cache for DurableCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.get_with_expiry(key).await?.map(|(value, _)| value))
    }

    async fn get_with_expiry(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Option<DateTime<Utc>>)>, CacheError> {
        let Some((path, record)) = self.read_record(key).await? else {
            debug!(key = key, "Durable cache MISS");
            return Ok(None);
        };

        if Utc::now() >= record.expires_at {
            debug!(key = key, "Durable cache entry expired");
            remove_if_present(&path).await?;
            return Ok(None);
        }

        debug!(key = key, "Durable cache HIT");
        Ok(Some((Bytes::from(record.value), Some(record.expires_at))))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let record = Record {
            value: value.to_vec(),
            expires_at: expiry_from(Utc::now(), ttl)?,
        };
        let data = serde_json::to_vec(&record).map_err(CacheError::Encode)?;

        let dir = self.dir.clone();
        let path = self.path_for(key);
        let size = data.len();
        let local = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &local, &data)).await??;

        debug!(key = key, local = %path.display(), size = size, "Stored record in durable cache");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        remove_if_present(&self.path_for(key)).await
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let suffix = format!(".{RECORD_EXT}");
        let files = match self.files_matching(|name| name.ends_with(&suffix)) {
            Ok(files) => files,
            // Nothing was ever stored
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let count = files.len();
        for path in files {
            remove_if_present(&path).await?;
        }
        info!(removed = count, cache_dir = %self.dir.display(), "Cleared durable cache");
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, DurableCache) {
        let dir = TempDir::new().unwrap();
        let cache = DurableCache::new(dir.path().join("cache")).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (_dir, cache) = open();
        let value = Bytes::from_static(b"[{\"id\":\"p1\"}]");

        assert!(cache.get("catalog:resources").await.unwrap().is_none());
        cache
            .set("catalog:resources", value.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("catalog:resources").await.unwrap(), Some(value));
        assert!(cache.has("catalog:resources").await.unwrap());

        cache.delete("catalog:resources").await.unwrap();
        cache.delete("catalog:resources").await.unwrap();
        assert!(!cache.has("catalog:resources").await.unwrap());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let (dir, cache) = open();
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        drop(cache);

        let reopened = DurableCache::new(dir.path().join("cache")).unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_expired_record_is_removed() {
        let (_dir, cache) = open();
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cache.get("k").await.unwrap().is_none());
        assert!(!cache.path_for("k").exists());
    }

    #[tokio::test]
    async fn test_record_format() {
        let (_dir, cache) = open();
        cache
            .set("k", Bytes::from_static(b"hello"), Duration::from_secs(60))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(cache.path_for("k")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["value"], "aGVsbG8=");
        assert!(json["expires_at"].as_str().unwrap().parse::<DateTime<Utc>>().is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_error_and_removed() {
        let (_dir, cache) = open();
        let path = cache.path_for("k");
        std::fs::write(&path, b"{not json").unwrap();

        let err = cache.get("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Decode { .. }));
        assert!(!path.exists());
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hostile_keys_stay_inside_dir() {
        let (_dir, cache) = open();
        for key in ["../etc/passwd", "/abs/path", "a/b\\c", "..", ""] {
            let path = cache.path_for(key);
            assert_eq!(path.parent(), Some(cache.dir()), "key {key:?}");
            cache
                .set(key, Bytes::from(key.to_string()), Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(cache.get(key).await.unwrap(), Some(Bytes::from(key.to_string())));
        }
        // Keys that sanitize to the same stem still get distinct files
        assert_ne!(cache.path_for("a/b"), cache.path_for("a:b"));
    }

    #[tokio::test]
    async fn test_clear_and_temp_cleanup() {
        let (dir, cache) = open();
        cache.set("a", Bytes::from_static(b"1"), Duration::from_secs(60)).await.unwrap();
        cache.set("b", Bytes::from_static(b"2"), Duration::from_secs(60)).await.unwrap();
        let stale = cache.dir().join(".leftover.tmp");
        std::fs::write(&stale, b"partial").unwrap();

        cache.clear().await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_none());

        DurableCache::new(dir.path().join("cache")).unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_clear_reports_unreadable_dir() {
        let (_dir, cache) = open();
        cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(60)).await.unwrap();

        // Cache directory replaced by a regular file
        std::fs::remove_dir_all(cache.dir()).unwrap();
        std::fs::write(cache.dir(), b"not a dir").unwrap();

        let err = cache.clear().await.unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_clear_of_missing_dir_is_ok() {
        let (_dir, cache) = open();
        std::fs::remove_dir_all(cache.dir()).unwrap();
        cache.clear().await.unwrap();
    }

    #[test]
    fn test_new_fails_when_dir_cannot_be_created() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let err = DurableCache::new(file.join("sub")).err().unwrap();
        assert!(matches!(err, CacheError::CreateDir { .. }));
    }
}
