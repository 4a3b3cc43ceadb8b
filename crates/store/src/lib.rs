//! kwork store: local object cache plus the informer feeding it

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kwork_core::Key;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;

mod informer;

pub use informer::Informer;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache lock poisoned")]
    Poisoned,
}

struct Inner<O> {
    items: RwLock<FxHashMap<Key, Arc<O>>>,
    synced: watch::Sender<bool>,
}

/// Thread-safe mirror of the watched collection, keyed by [`Key`].
///
/// Clones share the same map. Writers replace whole `Arc<O>` values, so a reader sees either
/// the previous object or the new one.
pub struct Cache<O> {
    inner: Arc<Inner<O>>,
}

impl<O> Clone for Cache<O> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<O> Default for Cache<O> {
    fn default() -> Self { Self::new() }
}

impl<O> Cache<O> {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self { inner: Arc::new(Inner { items: RwLock::new(FxHashMap::default()), synced }) }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, FxHashMap<Key, Arc<O>>>, CacheError> {
        self.inner.items.read().map_err(|_| CacheError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, FxHashMap<Key, Arc<O>>>, CacheError> {
        self.inner.items.write().map_err(|_| CacheError::Poisoned)
    }

    /// Store `obj` under `key`, returning the object it replaced.
    pub fn upsert(&self, key: Key, obj: O) -> Result<Option<Arc<O>>, CacheError> {
        Ok(self.write()?.insert(key, Arc::new(obj)))
    }

    pub fn remove(&self, key: &Key) -> Result<Option<Arc<O>>, CacheError> {
        Ok(self.write()?.remove(key))
    }

    /// Latest stored object for `key`; `Ok(None)` means it does not exist (deleted or never seen).
    pub fn get_by_key(&self, key: &str) -> Result<Option<Arc<O>>, CacheError> {
        Ok(self.read()?.get(key).cloned())
    }

    pub fn list_keys(&self) -> Result<Vec<Key>, CacheError> {
        let mut keys: Vec<Key> = self.read()?.keys().cloned().collect();
        keys.sort_unstable();
        Ok(keys)
    }

    pub fn list(&self) -> Result<Vec<Arc<O>>, CacheError> {
        Ok(self.read()?.values().cloned().collect())
    }

    pub fn len(&self) -> usize { self.read().map(|m| m.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Swap the whole content for `items` under one write lock. Returns the keys that were
    /// present before and are missing from `items`, sorted.
    pub fn replace(&self, items: Vec<(Key, O)>) -> Result<Vec<Key>, CacheError> {
        let mut map = self.write()?;
        let listed: FxHashSet<&Key> = items.iter().map(|(k, _)| k).collect();
        let mut gone: Vec<Key> = map.keys().filter(|k| !listed.contains(k)).cloned().collect();
        gone.sort_unstable();
        let mut next = FxHashMap::default();
        next.reserve(items.len());
        for (k, o) in items {
            next.insert(k, Arc::new(o));
        }
        *map = next;
        Ok(gone)
    }

    /// True once an initial full listing has been applied.
    pub fn has_synced(&self) -> bool { *self.inner.synced.borrow() }

    pub fn mark_synced(&self) {
        self.inner.synced.send_if_modified(|s| {
            let changed = !*s;
            *s = true;
            changed
        });
    }

    /// Resolve once [`Cache::has_synced`] is true.
    pub async fn wait_synced(&self) {
        let mut rx = self.inner.synced.subscribe();
        loop {
            let synced = *rx.borrow_and_update();
            if synced {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
