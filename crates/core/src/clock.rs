use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::CoreError;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn now_ms() -> Result<Timestamp, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}

/// `at + ttl`, saturating instead of wrapping.
pub fn add_ttl(at: Timestamp, ttl: Duration) -> Timestamp {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    at.saturating_add(ttl_ms)
}
