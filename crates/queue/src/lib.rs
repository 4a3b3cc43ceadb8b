//! kwork work queue: deduplicating, rate-limited, blocking queue of keys.
//!
//! A key lives in at most one of `queue` (pending) or `processing` at a time. Adding a key
//! that is already being processed only marks it dirty; [`WorkQueue::done`] puts it back,
//! so every burst of changes during a sync collapses into one follow-up sync.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kwork_core::{Key, KeySink};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod rate_limiter;

pub use rate_limiter::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    ItemFastSlowRateLimiter, MaxOfRateLimiter, RateLimiter,
};

#[derive(Default)]
struct State {
    queue: VecDeque<Key>,
    /// Keys that need processing: queued ones plus processing ones re-added mid-flight.
    dirty: FxHashSet<Key>,
    processing: FxHashSet<Key>,
    /// Delayed adds: key -> earliest ready time.
    waiting: FxHashMap<Key, Instant>,
    queued_at: FxHashMap<Key, Instant>,
    started_at: FxHashMap<Key, Instant>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    ready: Notify,
    idle: Notify,
    limiter: Box<dyn RateLimiter>,
    /// Fires on shutdown; releases the timers behind delayed adds.
    closed: CancellationToken,
}

/// Upper bound for a single delay, far enough out to never fire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Cloneable handle; clones share one queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                ready: Notify::new(),
                idle: Notify::new(),
                limiter: Box::new(limiter),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str { &self.inner.name }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: Key) {
        let mut st = self.state();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        metrics::counter!("workqueue_adds_total", 1u64, "queue" => self.inner.name.clone());
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            debug!(queue = %self.inner.name, key = %key, "key busy; marked dirty");
            return;
        }
        st.queued_at.entry(key.clone()).or_insert_with(Instant::now);
        st.queue.push_back(key);
        metrics::gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
        drop(st);
        self.inner.ready.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and drained.
    ///
    /// The returned key is held exclusively until [`WorkQueue::done`] is called for it.
    pub async fn get(&self) -> Option<Key> {
        loop {
            let notified = self.inner.ready.notified();
            {
                let mut st = self.state();
                if let Some(key) = st.queue.pop_front() {
                    st.processing.insert(key.clone());
                    st.dirty.remove(&key);
                    let now = Instant::now();
                    if let Some(t) = st.queued_at.remove(&key) {
                        metrics::histogram!(
                            "workqueue_queue_duration_ms",
                            now.saturating_duration_since(t).as_secs_f64() * 1000.0,
                            "queue" => self.inner.name.clone()
                        );
                    }
                    st.started_at.insert(key.clone(), now);
                    let more = !st.queue.is_empty();
                    metrics::gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
                    drop(st);
                    // Pass the wakeup on so a second idle waiter sees the remaining keys.
                    if more {
                        self.inner.ready.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `key` after its handler returned. A key re-added meanwhile is queued again.
    pub fn done(&self, key: &Key) {
        let mut st = self.state();
        if !st.processing.remove(key) {
            warn!(queue = %self.inner.name, key = %key, "done called for a key that is not processing");
        }
        if let Some(t) = st.started_at.remove(key) {
            metrics::histogram!(
                "workqueue_work_duration_ms",
                t.elapsed().as_secs_f64() * 1000.0,
                "queue" => self.inner.name.clone()
            );
        }
        if st.dirty.contains(key) {
            st.queued_at.entry(key.clone()).or_insert_with(Instant::now);
            st.queue.push_back(key.clone());
            drop(st);
            self.inner.ready.notify_one();
        } else if st.processing.is_empty() {
            drop(st);
            self.inner.idle.notify_waiters();
        }
    }

    /// Reset the retry history of `key`.
    pub fn forget(&self, key: &Key) { self.inner.limiter.forget(key); }

    pub fn num_requeues(&self, key: &Key) -> u32 { self.inner.limiter.num_requeues(key) }

    /// Requeue `key` after the delay chosen by the rate limiter, counting one more retry.
    pub fn add_rate_limited(&self, key: Key) {
        let delay = self.inner.limiter.when(&key);
        metrics::counter!("workqueue_retries_total", 1u64, "queue" => self.inner.name.clone());
        self.add_after(key, delay);
    }

    /// Add `key` once `delay` has elapsed. Pending delayed adds of one key keep the earliest time.
    pub fn add_after(&self, key: Key, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(queue = %self.inner.name, key = %key, "no runtime for delayed add; adding now");
            self.add(key);
            return;
        };
        let now = Instant::now();
        let ready_at = now.checked_add(delay.min(FAR_FUTURE)).unwrap_or(now);
        {
            let mut st = self.state();
            if st.shutting_down {
                return;
            }
            if matches!(st.waiting.get(&key), Some(t) if *t <= ready_at) {
                return;
            }
            st.waiting.insert(key.clone(), ready_at);
        }
        let queue = self.clone();
        rt.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(ready_at) => {}
                _ = queue.inner.closed.cancelled() => return,
            }
            let fire = {
                let mut st = queue.state();
                match st.waiting.get(&key) {
                    Some(t) if *t == ready_at => {
                        st.waiting.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if fire {
                queue.add(key);
            }
        });
    }

    /// Keys waiting to be handed out (not counting processing or delayed ones).
    pub fn len(&self) -> usize { self.state().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Keys currently parked behind a backoff delay.
    pub fn delayed(&self) -> usize { self.state().waiting.len() }

    pub fn is_shutting_down(&self) -> bool { self.state().shutting_down }

    /// Stop accepting keys and wake every waiter. Pending keys are still handed out.
    pub fn shut_down(&self) {
        {
            let mut st = self.state();
            st.shutting_down = true;
            st.waiting.clear();
        }
        self.inner.closed.cancel();
        debug!(queue = %self.inner.name, "queue shutting down");
        self.inner.ready.notify_waiters();
    }

    /// [`WorkQueue::shut_down`], then wait until no key is processing.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let idle = self.inner.idle.notified();
            let busy = !self.state().processing.is_empty();
            if !busy {
                return;
            }
            idle.await;
        }
    }
}

impl KeySink for WorkQueue {
    fn add(&self, key: Key) { WorkQueue::add(self, key) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_pending_timers() {
        let q = WorkQueue::with_default_rate_limiter("timers");
        q.add_after(Key::from("ns/a"), Duration::from_secs(600));
        q.add_after(Key::from("ns/b"), Duration::MAX);
        tokio::task::yield_now().await;
        assert_eq!(Arc::strong_count(&q.inner), 3);

        q.shut_down();
        for _ in 0..10 {
            if Arc::strong_count(&q.inner) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(&q.inner), 1);
    }
}
