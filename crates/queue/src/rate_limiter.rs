//! Requeue delay policies. Each limiter owns its per-key failure counts, so two queues
//! never share retry state.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kwork_core::Key;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may be processed again. Records one more failure for it.
    fn when(&self, key: &Key) -> Duration;
    /// Clear the failure history of `key`.
    fn forget(&self, key: &Key);
    /// Failures recorded for `key` since the last [`RateLimiter::forget`].
    fn num_requeues(&self, key: &Key) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<Key, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &Key) -> Duration {
        let mut failures = lock(&self.failures);
        let exp = failures.entry(key.clone()).or_insert(0);
        let n = *exp;
        *exp = exp.saturating_add(1);
        1u32.checked_shl(n)
            .and_then(|m| self.base.checked_mul(m))
            .unwrap_or(self.max)
            .min(self.max)
    }

    fn forget(&self, key: &Key) { lock(&self.failures).remove(key); }

    fn num_requeues(&self, key: &Key) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

/// `fast` for the first `max_fast_attempts` failures of a key, `slow` afterwards.
pub struct ItemFastSlowRateLimiter {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: u32,
    failures: Mutex<FxHashMap<Key, u32>>,
}

impl ItemFastSlowRateLimiter {
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: u32) -> Self {
        Self { fast, slow, max_fast_attempts, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl RateLimiter for ItemFastSlowRateLimiter {
    fn when(&self, key: &Key) -> Duration {
        let mut failures = lock(&self.failures);
        let n = failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        if *n <= self.max_fast_attempts { self.fast } else { self.slow }
    }

    fn forget(&self, key: &Key) { lock(&self.failures).remove(key); }

    fn num_requeues(&self, key: &Key) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket across all keys. Each call reserves one token; the returned delay is
/// how long the reservation has to wait for it. Tracks no per-key history.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &Key) -> Duration {
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst);
        b.last = now;
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-b.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _key: &Key) {}

    fn num_requeues(&self, _key: &Key) -> u32 { 0 }
}

/// Longest delay among its members.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self { Self { limiters } }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &Key) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &Key) {
        for l in &self.limiters { l.forget(key); }
    }

    fn num_requeues(&self, key: &Key) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key exponential backoff (5ms .. 1000s) combined with an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    controller_rate_limiter(Duration::from_millis(5), Duration::from_secs(1000), 10.0, 100)
}

pub fn controller_rate_limiter(base: Duration, max: Duration, qps: f64, burst: u32) -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(base, max)),
        Box::new(BucketRateLimiter::new(qps, burst)),
    ])
}
