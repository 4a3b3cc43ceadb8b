//! Change detection: applies transport deltas to the cache, then pushes keys to the queue.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kwork_core::{deletion_handling_key, meta_namespace_key, Delta, Key, KeySink, MetaAccessor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Cache;

/// Consumes a list/watch stream and keeps a [`Cache`] in step with it.
///
/// Every cache mutation happens before its key reaches the sink, so a worker that dequeues
/// the key always reads the post-mutation state.
pub struct Informer<O> {
    cache: Cache<O>,
    sink: Arc<dyn KeySink>,
    resync: Option<Duration>,
}

impl<O: MetaAccessor> Informer<O> {
    pub fn new(cache: Cache<O>, sink: Arc<dyn KeySink>) -> Self {
        Self { cache, sink, resync: None }
    }

    /// Re-emit every cached key every `period`.
    pub fn with_resync(mut self, period: Option<Duration>) -> Self {
        self.resync = period.filter(|p| !p.is_zero());
        self
    }

    pub fn cache(&self) -> &Cache<O> { &self.cache }

    /// Drive `stream` until it ends or `stop` fires. Transport errors are logged and skipped;
    /// the stream is expected to recover on its own.
    pub async fn run<S>(self, stream: S, stop: CancellationToken)
    where
        S: Stream<Item = anyhow::Result<Delta<O>>> + Send,
    {
        futures::pin_mut!(stream);
        let mut ticker = self.resync.map(|p| {
            let mut t = tokio::time::interval_at(tokio::time::Instant::now() + p, p);
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t
        });
        info!(resync = ?self.resync, "informer started");
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!("stop requested; informer exiting");
                    break;
                }
                _ = async {
                    match ticker.as_mut() {
                        Some(t) => { t.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => self.resync_all(),
                next = stream.next() => match next {
                    Some(Ok(delta)) => self.handle(delta),
                    Some(Err(e)) => {
                        metrics::counter!("informer_watch_errors_total", 1u64);
                        warn!(error = ?e, "watch stream error");
                    }
                    None => {
                        warn!("watch stream ended");
                        break;
                    }
                },
            }
        }
        info!("informer stopped");
    }

    /// Apply one delta: mutate the cache first, then emit the affected key(s).
    pub fn handle(&self, delta: Delta<O>) {
        match delta {
            Delta::Applied(obj) => {
                metrics::counter!("informer_events_total", 1u64, "type" => "applied");
                let key = match meta_namespace_key(&obj) {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(error = %e, kind = obj.kind(), "skipping object without key");
                        return;
                    }
                };
                match self.cache.upsert(key.clone(), obj) {
                    Ok(_) => self.emit(key),
                    Err(e) => warn!(key = %key, error = %e, "cache upsert failed"),
                }
            }
            Delta::Deleted(_) | Delta::Tombstone { .. } => {
                metrics::counter!("informer_events_total", 1u64, "type" => "deleted");
                let key = match deletion_handling_key(&delta) {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(error = %e, "skipping delete without key");
                        return;
                    }
                };
                match self.cache.remove(&key) {
                    Ok(_) => self.emit(key),
                    Err(e) => warn!(key = %key, error = %e, "cache remove failed"),
                }
            }
            Delta::Restarted(list) => {
                metrics::counter!("informer_events_total", 1u64, "type" => "restarted");
                let mut items = Vec::with_capacity(list.len());
                for obj in list {
                    match meta_namespace_key(&obj) {
                        Ok(k) => items.push((k, obj)),
                        Err(e) => warn!(error = %e, kind = obj.kind(), "skipping listed object without key"),
                    }
                }
                let listed: Vec<Key> = items.iter().map(|(k, _)| k.clone()).collect();
                let gone = match self.cache.replace(items) {
                    Ok(gone) => gone,
                    Err(e) => {
                        warn!(error = %e, "cache replace failed");
                        return;
                    }
                };
                debug!(listed = listed.len(), vanished = gone.len(), "full listing applied");
                // Objects missing from the relist were deleted while we were not watching.
                for key in gone {
                    self.emit(key);
                }
                for key in listed {
                    self.emit(key);
                }
                if !self.cache.has_synced() {
                    self.cache.mark_synced();
                    info!(items = self.cache.len(), "cache synced");
                }
            }
        }
    }

    fn resync_all(&self) {
        match self.cache.list_keys() {
            Ok(keys) => {
                debug!(count = keys.len(), "resync");
                for key in keys {
                    self.emit(key);
                }
            }
            Err(e) => warn!(error = %e, "resync skipped"),
        }
    }

    fn emit(&self, key: Key) {
        debug!(key = %key, "key changed");
        self.sink.add(key);
    }
}
