use std::sync::atomic::{AtomicU64, Ordering};

pub const DEADLOCKS_TOTAL: &str = "fleetsync_deadlocks_total";
pub const SERIALIZATION_FAILURES_TOTAL: &str = "fleetsync_serialization_failures_total";
pub const RETRIES_TOTAL: &str = "fleetsync_retries_total";
pub const RETRY_SUCCESSES_TOTAL: &str = "fleetsync_retry_successes_total";

/// Counter sink for the write path. Observability only; nothing reads these
/// back to make decisions.
pub trait MetricsSink: Send + Sync {
    fn record_deadlock(&self, batch: &str);
    fn record_serialization_failure(&self, batch: &str);
    fn record_retry(&self, batch: &str);
    fn record_retry_success(&self, batch: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_deadlock(&self, _: &str) {}
    fn record_serialization_failure(&self, _: &str) {}
    fn record_retry(&self, _: &str) {}
    fn record_retry_success(&self, _: &str) {}
}

/// Process-lifetime counters behind an explicit handle.
#[derive(Debug, Default)]
pub struct RetryCounters {
    deadlocks: AtomicU64,
    serialization_failures: AtomicU64,
    retries: AtomicU64,
    retry_successes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub deadlocks: u64,
    pub serialization_failures: u64,
    pub retries: u64,
    pub retry_successes: u64,
}

impl RetryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            serialization_failures: self.serialization_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            retry_successes: self.retry_successes.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for RetryCounters {
    fn record_deadlock(&self, _: &str) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
    }

    fn record_serialization_failure(&self, _: &str) {
        self.serialization_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self, _: &str) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry_success(&self, _: &str) {
        self.retry_successes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Forwards to whatever recorder is installed for the `metrics` facade,
/// labelled by batch name.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn record_deadlock(&self, batch: &str) {
        metrics::counter!(DEADLOCKS_TOTAL, "batch" => batch.to_string()).increment(1);
    }

    fn record_serialization_failure(&self, batch: &str) {
        metrics::counter!(SERIALIZATION_FAILURES_TOTAL, "batch" => batch.to_string()).increment(1);
    }

    fn record_retry(&self, batch: &str) {
        metrics::counter!(RETRIES_TOTAL, "batch" => batch.to_string()).increment(1);
    }

    fn record_retry_success(&self, batch: &str) {
        metrics::counter!(RETRY_SUCCESSES_TOTAL, "batch" => batch.to_string()).increment(1);
    }
}
