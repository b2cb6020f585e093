//! Warm-up and periodic refresh of the cached collections

pub mod manager;
pub mod snapshot;

pub use manager::{fetcher, Fetcher, RefreshManager, RefreshOutcome};
pub use snapshot::SnapshotSource;
