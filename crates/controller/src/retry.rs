//! Bounded retry, then drop and report.

use kwork_core::Key;
use tracing::error;

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Requeue with backoff
    Retry,
    /// Give up until a new change event re-adds the key
    Drop,
}

/// Allows `max_retries` attempts per key: attempts `1..max_retries` are retried, the
/// `max_retries`-th failure drops the key.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self { Self { max_retries: max_retries.max(1) } }

    pub fn max_retries(&self) -> u32 { self.max_retries }

    /// `failures` counts the failure being classified (1 for the first one).
    pub fn on_failure(&self, failures: u32) -> Verdict {
        if failures < self.max_retries { Verdict::Retry } else { Verdict::Drop }
    }
}

/// Process-wide destination for keys dropped after exhausting their retries.
/// Reports are diagnostics only.
pub trait ErrorSink: Send + Sync {
    fn report(&self, key: &Key, err: &SyncError);
}

/// Logs dropped keys at error level and counts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, key: &Key, err: &SyncError) {
        metrics::counter!("controller_dropped_keys_total", 1u64);
        error!(key = %key, error = %err, "sync failed permanently");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_attempts_then_drop() {
        let p = RetryPolicy::new(5);
        let verdicts: Vec<_> = (1..=5).map(|f| p.on_failure(f)).collect();
        assert_eq!(verdicts, vec![Verdict::Retry, Verdict::Retry, Verdict::Retry, Verdict::Retry, Verdict::Drop]);
        assert_eq!(p.on_failure(9), Verdict::Drop);
    }

    #[test]
    fn single_attempt_policy_drops_immediately() {
        assert_eq!(RetryPolicy::new(1).on_failure(1), Verdict::Drop);
        assert_eq!(RetryPolicy::new(0).max_retries(), 1);
    }
}
