use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use fleetsync_core::{CancelToken, SqlStateError};
use fleetsync_engine::Pause;
use fleetsync_storage::{BatchError, StorageError};
use rusqlite::ffi;

type Hook = Box<dyn Fn(usize, &CancelToken) + Send + Sync>;

/// Records every requested delay instead of sleeping.
#[derive(Default)]
pub struct RecordingPause {
    delays: Mutex<Vec<Duration>>,
    hook: Option<Hook>,
}

impl RecordingPause {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `hook(n, cancel)` on the n-th pause (0-based) before returning.
    pub fn with_hook(hook: impl Fn(usize, &CancelToken) + Send + Sync + 'static) -> Self {
        Self {
            delays: Mutex::new(Vec::new()),
            hook: Some(Box::new(hook)),
        }
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

impl Pause for RecordingPause {
    fn pause(&self, delay: Duration, cancel: &CancelToken) -> bool {
        let n = match self.delays.lock() {
            Ok(mut delays) => {
                delays.push(delay);
                delays.len() - 1
            }
            Err(_) => 0,
        };
        if let Some(hook) = &self.hook {
            hook(n, cancel);
        }
        cancel.is_cancelled()
    }
}

/// A batch that fails with queued errors, then succeeds.
pub struct ScriptedBatch {
    failures: Mutex<VecDeque<BatchError>>,
    calls: Mutex<usize>,
}

impl ScriptedBatch {
    pub fn new(failures: impl IntoIterator<Item = BatchError>) -> Self {
        Self {
            failures: Mutex::new(failures.into_iter().collect()),
            calls: Mutex::new(0),
        }
    }

    pub fn run(&self) -> Result<usize, BatchError> {
        let call = {
            let mut calls = self.calls.lock().unwrap_or_else(|p| p.into_inner());
            *calls += 1;
            *calls
        };
        match self.failures.lock().unwrap_or_else(|p| p.into_inner()).pop_front() {
            Some(err) => Err(err),
            None => Ok(call),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Statement failure carrying a SQLSTATE, as a Postgres-family provider
/// would report it.
pub fn transient(code: &str) -> BatchError {
    BatchError::statement(
        "scripted",
        0,
        StorageError::Backend(Box::new(SqlStateError::new(code, "scripted failure"))),
    )
}

pub fn permanent(message: &str) -> BatchError {
    BatchError::statement("scripted", 0, StorageError::Serialization(message.to_string()))
}

pub fn sqlite_busy() -> BatchError {
    let err = rusqlite::Error::SqliteFailure(
        ffi::Error::new(ffi::SQLITE_BUSY),
        Some("database is locked".to_string()),
    );
    BatchError::statement("scripted", 0, StorageError::Sqlite(err))
}
