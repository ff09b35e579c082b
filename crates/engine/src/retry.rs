//! Whole-batch retry with classified backoff.
//!
//! A failed batch is re-run from scratch; the executor's session already
//! rolled back (atomic mode) or left a tolerated partial write (pipelined
//! mode). Only transient classes are retried.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use fleetsync_core::classify::{ErrorClass, ErrorClassifier, chain_text};
use fleetsync_core::{BackoffPolicy, CancelToken, MetricsSink, NoopMetrics, RetryConfig};
use fleetsync_storage::{BatchError, SqliteClassifier};

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("batch {name} cancelled after {attempts} attempt(s)")]
    Cancelled { name: String, attempts: u32 },

    #[error("batch {name} failed after {attempts} attempt(s) (code {code:?}, transient: {transient})")]
    Failed {
        name: String,
        attempts: u32,
        code: String,
        transient: bool,
        #[source]
        source: BatchError,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    /// Index of the statement that failed on the last attempt.
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            Self::Failed { source, .. } => source.index(),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Suspends the caller between attempts.
pub trait Pause: Send + Sync {
    /// Waits for `delay` or until `cancel` fires. Returns `true` if cancelled.
    fn pause(&self, delay: Duration, cancel: &CancelToken) -> bool;
}

/// Parks the current thread on the cancel token's condvar.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, delay: Duration, cancel: &CancelToken) -> bool {
        cancel.wait_timeout(delay)
    }
}

pub struct RetryController {
    max_attempts: u32,
    backoff: BackoffPolicy,
    classifier: Arc<dyn ErrorClassifier>,
    metrics: Arc<dyn MetricsSink>,
    pause: Arc<dyn Pause>,
}

impl RetryController {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: BackoffPolicy::from_config(config),
            classifier: Arc::new(SqliteClassifier),
            metrics: Arc::new(NoopMetrics),
            pause: Arc::new(ThreadPause),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_pause(mut self, pause: Arc<dyn Pause>) -> Self {
        self.pause = pause;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts its attempts,
    /// or `cancel` fires. `op` must rebuild the whole batch on every call.
    pub fn submit<T>(
        &self,
        name: &str,
        cancel: &CancelToken,
        mut op: impl FnMut() -> Result<T, BatchError>,
    ) -> Result<T, RetryError> {
        let max_attempts = self.max_attempts;
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    name: name.to_string(),
                    attempts: attempt - 1,
                });
            }

            let err = match op() {
                Ok(value) => {
                    if attempt > 1 {
                        self.metrics.record_retry_success(name);
                        debug!(batch = name, attempt, "batch succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let classification = self.classifier.classify(Some(&err as &(dyn Error + 'static)));
            match classification.class {
                ErrorClass::Deadlock => self.metrics.record_deadlock(name),
                ErrorClass::Serialization => self.metrics.record_serialization_failure(name),
                _ => {}
            }

            let transient = classification.is_transient();
            if transient && attempt < max_attempts {
                self.metrics.record_retry(name);
                let delay = self.backoff.delay(attempt, classification.class);
                warn!(
                    code = %classification.code,
                    batch = name,
                    attempt,
                    max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %chain_text(&err),
                    "transient error, retrying batch"
                );
                if self.pause.pause(delay, cancel) {
                    return Err(RetryError::Cancelled {
                        name: name.to_string(),
                        attempts: attempt,
                    });
                }
                attempt += 1;
                continue;
            }

            error!(
                code = %classification.code,
                batch = name,
                attempt,
                max_attempts,
                transient,
                error = %chain_text(&err),
                "batch failed"
            );
            return Err(RetryError::Failed {
                name: name.to_string(),
                attempts: attempt,
                code: classification.code,
                transient,
                source: err,
            });
        }
    }
}
