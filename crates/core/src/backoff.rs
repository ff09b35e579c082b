use std::time::Duration;

use rand::Rng;

use crate::classify::ErrorClass;
use crate::config::RetryConfig;

/// Exponential backoff with additive jitter.
///
/// `delay(a) = base * 2^(a-1) + U[0, base)` where `base` depends on whether
/// the error came from competing writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub lock_base: Duration,
    pub transient_base: Duration,
}

impl BackoffPolicy {
    pub fn new(lock_base: Duration, transient_base: Duration) -> Self {
        Self {
            lock_base,
            transient_base,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.lock_backoff, config.transient_backoff)
    }

    pub fn base_for(&self, class: ErrorClass) -> Duration {
        if class.is_lock_contention() {
            self.lock_base
        } else {
            self.transient_base
        }
    }

    /// Attempts are 1-based; anything below 1 is treated as 1.
    pub fn delay(&self, attempt: u32, class: ErrorClass) -> Duration {
        let base = self.base_for(class);
        let exponent = attempt.max(1) - 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let backoff = base.saturating_mul(factor);

        let jitter_max = u64::try_from(base.as_nanos()).unwrap_or(u64::MAX);
        if jitter_max == 0 {
            return backoff;
        }
        let jitter = rand::thread_rng().gen_range(0..jitter_max);
        backoff.saturating_add(Duration::from_nanos(jitter))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
