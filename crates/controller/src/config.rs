use std::time::Duration;

use kwork_queue::{controller_rate_limiter, MaxOfRateLimiter};

use crate::ControllerError;

/// Static controller parameters, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Used for the queue name and log/metric labels
    pub name: String,
    /// Number of concurrent workers
    pub workers: usize,
    /// Attempts per key before it is dropped
    pub max_retries: u32,
    /// First per-key backoff; doubles per failure
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Overall requeue rate across keys
    pub qps: f64,
    pub burst: u32,
    /// Give up on startup if the initial listing takes longer; `None` waits until stopped
    pub cache_sync_timeout: Option<Duration>,
    /// Re-queue every cached key periodically; `None` disables
    pub resync_period: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            workers: 1,
            max_retries: 5,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
            cache_sync_timeout: Some(Duration::from_secs(60)),
            resync_period: None,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(ControllerError::InvalidConfig("max_retries must be at least 1".into()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ControllerError::InvalidConfig("backoff_base exceeds backoff_max".into()));
        }
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(ControllerError::InvalidConfig(format!("qps must be positive, got {}", self.qps)));
        }
        Ok(())
    }

    pub fn rate_limiter(&self) -> MaxOfRateLimiter {
        controller_rate_limiter(self.backoff_base, self.backoff_max, self.qps, self.burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = ControllerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.workers, 1);
    }

    #[test]
    fn rejects_nonsense() {
        let bad = [
            ControllerConfig { workers: 0, ..Default::default() },
            ControllerConfig { max_retries: 0, ..Default::default() },
            ControllerConfig { backoff_base: Duration::from_secs(5), backoff_max: Duration::from_secs(1), ..Default::default() },
            ControllerConfig { qps: 0.0, ..Default::default() },
            ControllerConfig { qps: f64::NAN, ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(ControllerError::InvalidConfig(_))), "{:?}", cfg);
        }
    }
}
