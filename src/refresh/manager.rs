//! Refresh Manager - keeps cache keys warm
//!
//! Owns at most one periodic refresh task per cache key. Each task re-runs
//! its fetch on a fixed interval and writes the result only when its content
//! digest changed. Tasks stop on their own stop token or on the ambient
//! shutdown token handed to the manager.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Cache, ContentDigest};

/// Future returned by a fetch function
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>;

/// Caller-supplied "fetch, filter and serialize" function for one key.
///
/// Receives a cancellation token that fires when the refresh is stopped.
pub type Fetcher = Arc<dyn Fn(CancellationToken) -> FetchFuture + Send + Sync>;

/// Wrap an async closure as a [`Fetcher`]
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    Arc::new(move |cancel| Box::pin(f(cancel)) as FetchFuture)
}

/// What one refresh cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Fetch failed; cached content left untouched
    FetchFailed,
    /// Stopped while fetching; result thrown away
    Discarded,
    /// Key was empty and has been filled
    Populated,
    /// Fetched content matches the cache; nothing written
    Unchanged,
    /// Fetched content differs and replaced the cached value
    Updated,
    /// Fetch succeeded but the cache rejected the write
    WriteFailed,
}

/// Handle to a running refresh task
struct RefreshHandle {
    /// Interval the task ticks at
    interval: Duration,
    /// Signals this task alone to stop
    stop: CancellationToken,
    /// Background task running the loop
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Signal the task and wait for it to exit
    async fn shutdown(self, key: &str) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(key = key, error = %e, "Refresh task panicked");
        }
    }
}

/// State shared between the manager and its tasks
struct Shared {
    cache: Arc<dyn Cache>,
    /// TTL of every write made by warm-up and refresh
    ttl: Duration,
}

/// Manages warm-up and periodic refresh of cache keys
pub struct RefreshManager {
    shared: Arc<Shared>,
    /// Ambient shutdown signal; every task's stop token is a child of it
    shutdown: CancellationToken,
    /// Active refresh tasks by cache key
    tasks: Mutex<HashMap<String, RefreshHandle>>,
}

impl RefreshManager {
    /// Create a manager writing into `cache` with lifetime `ttl`
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration, shutdown: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared { cache, ttl }),
            shutdown,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Populate `key` once.
    ///
    /// A failure is logged and returned; it never panics the caller.
    pub async fn warm(&self, key: &str, fetch: &Fetcher) -> Result<()> {
        let result = async {
            let bytes = fetch(self.shutdown.child_token())
                .await
                .with_context(|| format!("Warm-up fetch failed for '{key}'"))?;
            let size = bytes.len();
            self.shared
                .cache
                .set(key, bytes, self.shared.ttl)
                .await
                .with_context(|| format!("Failed to cache warmed value for '{key}'"))?;
            Ok::<_, anyhow::Error>(size)
        }
        .await;

        match result {
            Ok(size) => {
                info!(key = key, size = size, "Cache warmed");
                Ok(())
            }
            Err(e) => {
                warn!(key = key, error = %format!("{e:#}"), "Cache warm-up failed");
                Err(e)
            }
        }
    }

    /// Warm several keys concurrently, giving up after `timeout`.
    ///
    /// Returns how many keys were warmed.
    pub async fn warm_all(&self, jobs: &[(&str, Fetcher)], timeout: Duration) -> usize {
        let warmups = join_all(jobs.iter().map(|(key, fetch)| self.warm(key, fetch)));
        match tokio::time::timeout(timeout, warmups).await {
            Ok(results) => results.iter().filter(|r| r.is_ok()).count(),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Cache warm-up timed out");
                0
            }
        }
    }

    /// Run one refresh cycle for `key`
    pub async fn refresh_once(&self, key: &str, fetch: &Fetcher) -> RefreshOutcome {
        let cancel = self.shutdown.child_token();
        refresh_cycle(&self.shared, key, fetch, &cancel).await
    }

    /// Start refreshing `key` every `interval`.
    ///
    /// A task already running for `key` is stopped and awaited first, so at
    /// most one loop ever writes a given key.
    pub async fn start_periodic_refresh(&self, key: &str, interval: Duration, fetch: Fetcher) {
        let mut tasks = self.tasks.lock().await;

        if let Some(previous) = tasks.remove(key) {
            debug!(key = key, "Replacing running refresh task");
            previous.shutdown(key).await;
        }

        let interval = interval.max(Duration::from_millis(1));
        let stop = self.shutdown.child_token();
        let task = tokio::spawn(refresh_loop(
            self.shared.clone(),
            key.to_string(),
            interval,
            fetch,
            stop.clone(),
        ));

        tasks.insert(
            key.to_string(),
            RefreshHandle {
                interval,
                stop,
                task,
            },
        );
        info!(key = key, interval_secs = interval.as_secs_f64(), "Started periodic refresh");
    }

    /// Stop refreshing `key`; returns whether a task was running
    #[cfg(test)]
    pub async fn stop(&self, key: &str) -> bool {
        let handle = self.tasks.lock().await.remove(key);
        match handle {
            Some(handle) => {
                handle.shutdown(key).await;
                info!(key = key, "Stopped periodic refresh");
                true
            }
            None => false,
        }
    }

    /// Stop every refresh task and wait for all of them to exit
    pub async fn stop_all(&self) {
        let handles: Vec<(String, RefreshHandle)> = self.tasks.lock().await.drain().collect();
        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), "Stopping all refresh tasks...");
        for (_, handle) in &handles {
            handle.stop.cancel();
        }
        for (key, handle) in handles {
            handle.shutdown(&key).await;
        }
        info!("All refresh tasks stopped");
    }

    /// Whether a refresh task is active for `key`
    #[cfg(test)]
    pub async fn is_running(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(key)
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Keys with an active refresh task, with their intervals
    pub async fn active_keys(&self) -> Vec<(String, Duration)> {
        let tasks = self.tasks.lock().await;
        let mut keys: Vec<_> = tasks
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(k, h)| (k.clone(), h.interval))
            .collect();
        keys.sort();
        keys
    }
}

impl Drop for RefreshManager {
    fn drop(&mut self) {
        // Tasks can't be awaited here; signal them so none outlives the manager
        if let Ok(tasks) = self.tasks.try_lock() {
            for handle in tasks.values() {
                handle.stop.cancel();
            }
        }
    }
}

async fn refresh_loop(
    shared: Arc<Shared>,
    key: String,
    interval: Duration,
    fetch: Fetcher,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                refresh_cycle(&shared, &key, &fetch, &stop).await;
            }
        }
    }

    debug!(key = %key, "Refresh task exited");
}

async fn refresh_cycle(
    shared: &Shared,
    key: &str,
    fetch: &Fetcher,
    cancel: &CancellationToken,
) -> RefreshOutcome {
    let fetched = fetch(cancel.clone()).await;

    if cancel.is_cancelled() {
        debug!(key = key, "Refresh cancelled, discarding fetch result");
        return RefreshOutcome::Discarded;
    }

    let fresh = match fetched {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(
                key = key,
                error = %format!("{e:#}"),
                "Refresh fetch failed, keeping cached value"
            );
            return RefreshOutcome::FetchFailed;
        }
    };

    let current = match shared.cache.get(key).await {
        Ok(current) => current,
        Err(e) => {
            warn!(key = key, error = %e, "Failed to read cached value, treating as empty");
            None
        }
    };

    let outcome = match current {
        None => RefreshOutcome::Populated,
        Some(current) => {
            let old = ContentDigest::of(&current);
            let new = ContentDigest::of(&fresh);
            if old == new {
                debug!(key = key, digest = %new, "Content unchanged, skipping write");
                return RefreshOutcome::Unchanged;
            }
            debug!(key = key, old = %old, new = %new, "Content changed");
            RefreshOutcome::Updated
        }
    };

    let size = fresh.len();
    if let Err(e) = shared.cache.set(key, fresh, shared.ttl).await {
        warn!(key = key, error = %e, "Failed to write refreshed value");
        return RefreshOutcome::WriteFailed;
    }

    info!(key = key, size = size, outcome = ?outcome, "Cache refreshed");
    outcome
}
