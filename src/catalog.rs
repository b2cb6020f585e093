//! Catalog - consumer read path
//!
//! Serves the "resource" and "prompt" collections out of the layered cache.
//! A miss (or an unreadable cached value) falls back to a live upstream
//! fetch whose result is written back. Upstream failures surface as errors,
//! never as an empty list.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Cache, DetailCache, PROMPTS_KEY, RESOURCES_KEY};
use crate::notion::UpstreamItem;
use crate::refresh::{fetcher, Fetcher, SnapshotSource};

/// The two kinds of item the catalog serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Resource,
    Prompt,
}

impl ItemKind {
    pub const ALL: [ItemKind; 2] = [ItemKind::Resource, ItemKind::Prompt];

    /// Reserved cache key holding this kind's collection
    pub fn cache_key(self) -> &'static str {
        match self {
            ItemKind::Resource => RESOURCES_KEY,
            ItemKind::Prompt => PROMPTS_KEY,
        }
    }

    /// Value of the type property marking this kind
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Resource => "resource",
            ItemKind::Prompt => "prompt",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "resource" | "resources" => Ok(ItemKind::Resource),
            "prompt" | "prompts" => Ok(ItemKind::Prompt),
            other => Err(anyhow!("Unknown item kind '{other}' (expected resources or prompts)")),
        }
    }
}

/// Items of `kind`, in upstream order
pub fn filter_kind(items: &[UpstreamItem], type_field: &str, kind: ItemKind) -> Vec<UpstreamItem> {
    items
        .iter()
        .filter(|item| item.kind(type_field) == Some(kind.as_str()))
        .cloned()
        .collect()
}

pub fn encode_items(items: &[UpstreamItem]) -> Result<Bytes> {
    let json = serde_json::to_vec(items).context("Failed to serialize items")?;
    Ok(Bytes::from(json))
}

pub fn decode_items(bytes: &[u8]) -> Result<Vec<UpstreamItem>> {
    serde_json::from_slice(bytes).context("Failed to deserialize cached items")
}

/// Read access to cached collections and item details
pub struct Catalog {
    cache: Arc<dyn Cache>,
    source: Arc<SnapshotSource>,
    details: DetailCache,
    /// Select property that classifies items
    type_field: Arc<str>,
    /// Lifetime of collections written after a live fetch
    ttl: Duration,
}

impl Catalog {
    pub fn new(
        cache: Arc<dyn Cache>,
        source: Arc<SnapshotSource>,
        type_field: &str,
        ttl: Duration,
        detail_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            source,
            details: DetailCache::new(detail_ttl),
            type_field: Arc::from(type_field),
            ttl,
        }
    }

    /// Fetch function for `kind`, used by warm-up and periodic refresh
    pub fn fetcher(&self, kind: ItemKind) -> Fetcher {
        let source = self.source.clone();
        let type_field = self.type_field.clone();
        fetcher(move |cancel| {
            let source = source.clone();
            let type_field = type_field.clone();
            async move {
                let all = source
                    .items(&cancel)
                    .await
                    .with_context(|| format!("Failed to fetch {kind} items from Notion"))?;
                encode_items(&filter_kind(&all, &type_field, kind))
            }
        })
    }

    /// Warm-up jobs for every kind
    pub fn fetchers(&self) -> Vec<(&'static str, Fetcher)> {
        ItemKind::ALL
            .iter()
            .map(|&kind| (kind.cache_key(), self.fetcher(kind)))
            .collect()
    }

    pub async fn resources(&self, cancel: &CancellationToken) -> Result<Vec<UpstreamItem>> {
        self.items(ItemKind::Resource, cancel).await
    }

    pub async fn prompts(&self, cancel: &CancellationToken) -> Result<Vec<UpstreamItem>> {
        self.items(ItemKind::Prompt, cancel).await
    }

    /// Items of `kind`, from cache when possible
    pub async fn items(
        &self,
        kind: ItemKind,
        cancel: &CancellationToken,
    ) -> Result<Vec<UpstreamItem>> {
        let key = kind.cache_key();

        match self.cache.get(key).await {
            Ok(Some(bytes)) => match decode_items(&bytes) {
                Ok(items) => {
                    debug!(key = key, count = items.len(), "Served items from cache");
                    return Ok(items);
                }
                Err(e) => warn!(
                    key = key,
                    error = %format!("{e:#}"),
                    "Cached items unreadable, fetching live"
                ),
            },
            Ok(None) => debug!(key = key, "Cache miss, fetching live"),
            Err(e) => warn!(key = key, error = %e, "Cache read failed, fetching live"),
        }

        let all = self
            .source
            .items(cancel)
            .await
            .with_context(|| format!("Failed to fetch {kind} items from Notion"))?;
        let items = filter_kind(&all, &self.type_field, kind);

        match encode_items(&items) {
            Ok(bytes) => {
                if let Err(e) = self.cache.set(key, bytes, self.ttl).await {
                    warn!(key = key, error = %e, "Failed to cache live fetch result");
                }
            }
            Err(e) => warn!(
                key = key,
                error = %format!("{e:#}"),
                "Failed to encode live fetch result"
            ),
        }

        info!(key = key, count = items.len(), "Served items from live fetch");
        Ok(items)
    }

    /// One item with its content blocks
    pub async fn item(&self, id: &str, cancel: &CancellationToken) -> Result<Arc<UpstreamItem>> {
        if let Some(item) = self.details.get(id) {
            return Ok(item);
        }

        let item = self
            .source
            .client()
            .fetch_item_detail(id, cancel)
            .await
            .with_context(|| format!("Failed to fetch item '{id}' from Notion"))?;
        Ok(self.details.insert(item))
    }

    /// Empty both cache tiers and the detail cache
    pub async fn clear(&self) -> Result<()> {
        self.details.clear();
        self.source.invalidate().await;
        self.cache.clear().await.context("Failed to clear cache")
    }

    pub fn detail_cache(&self) -> &DetailCache {
        &self.details
    }
}
