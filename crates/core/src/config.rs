use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

pub const MAX_RETRY_ATTEMPTS_ENV: &str = "FLEETSYNC_MAX_RETRY_ATTEMPTS";
pub const DEADLOCK_BACKOFF_MS_ENV: &str = "FLEETSYNC_DEADLOCK_BACKOFF_MS";
pub const BASE_BACKOFF_MS_ENV: &str = "FLEETSYNC_BASE_BACKOFF_MS";

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_DEADLOCK_BACKOFF_MS: u64 = 500;
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 150;
pub const DEFAULT_SIGHTING_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub lock_backoff: Duration,
    #[serde(with = "millis")]
    pub transient_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            lock_backoff: Duration::from_millis(DEFAULT_DEADLOCK_BACKOFF_MS),
            transient_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Blank, unparsable, or
    /// non-positive values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_attempts = positive(&lookup, MAX_RETRY_ATTEMPTS_ENV)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(DEFAULT_MAX_RETRY_ATTEMPTS);
        let lock_ms = positive(&lookup, DEADLOCK_BACKOFF_MS_ENV).unwrap_or(DEFAULT_DEADLOCK_BACKOFF_MS);
        let base_ms = positive(&lookup, BASE_BACKOFF_MS_ENV).unwrap_or(DEFAULT_BASE_BACKOFF_MS);
        Self {
            max_attempts,
            lock_backoff: Duration::from_millis(lock_ms),
            transient_backoff: Duration::from_millis(base_ms),
        }
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<i64>() {
        Ok(v) if v > 0 => Some(v as u64),
        Ok(v) => {
            warn!(key, value = v, "non-positive setting ignored");
            None
        }
        Err(e) => {
            warn!(key, value = raw, error = %e, "unparsable setting ignored");
            None
        }
    }
}

/// Sighting lifecycle tuning. `default_ttl = None` disables expiry for
/// sightings without an explicit or policy TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub default_ttl: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(DEFAULT_SIGHTING_TTL),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
