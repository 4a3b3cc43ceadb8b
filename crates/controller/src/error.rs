use std::time::Duration;

use kwork_store::CacheError;

/// Why one sync attempt failed. Every variant is retried the same way.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("fetching object from cache failed: {0}")]
    Lookup(#[from] CacheError),
    #[error("sync handler failed: {0:#}")]
    Handler(anyhow::Error),
    #[error("sync handler panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The initial listing never completed; workers were not started.
    #[error("timed out waiting for caches to sync after {0:?}")]
    CacheSyncTimeout(Duration),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("worker task failed: {0}")]
    Join(String),
}
