//! Ordered execution of a batch of write intents against one session.
//!
//! The executor has no retry logic of its own. It runs every intent in order,
//! stops at the first failure, and always closes the session, even when a
//! statement panics.

use std::panic::{self, AssertUnwindSafe};

use rusqlite::Connection;
use rusqlite::types::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::StorageError;

/// One parameterised statement queued for a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteIntent {
    pub sql: String,
    pub params: Vec<Value>,
    pub label: &'static str,
}

impl WriteIntent {
    pub fn new(label: &'static str, sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            label,
        }
    }
}

/// Rows affected by each intent, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub affected: Vec<usize>,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.affected.iter().sum()
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch {name}: could not open session")]
    Begin {
        name: String,
        #[source]
        source: StorageError,
    },

    #[error("batch {name}: statement {index} failed")]
    Statement {
        name: String,
        index: usize,
        #[source]
        source: StorageError,
    },

    #[error("batch {name}: close failed")]
    Close {
        name: String,
        #[source]
        source: StorageError,
    },
}

impl BatchError {
    pub fn statement(name: &str, index: usize, source: impl Into<StorageError>) -> Self {
        Self::Statement {
            name: name.to_string(),
            index,
            source: source.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Begin { name, .. } | Self::Statement { name, .. } | Self::Close { name, .. } => name,
        }
    }

    /// Index of the failing statement, if a statement failed.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Statement { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn storage_error(&self) -> &StorageError {
        match self {
            Self::Begin { source, .. } | Self::Statement { source, .. } | Self::Close { source, .. } => source,
        }
    }
}

/// A backend session that executes queued intents and is closed exactly once.
///
/// `close(ok)` receives `false` when any statement failed or panicked; a
/// transactional session rolls back in that case.
pub trait BatchSession {
    fn exec(&mut self, index: usize, intent: &WriteIntent) -> Result<usize, StorageError>;
    fn close(self, ok: bool) -> Result<(), StorageError>;
}

pub fn execute_batch<S: BatchSession>(
    name: &str,
    intents: &[WriteIntent],
    mut session: S,
) -> Result<BatchOutcome, BatchError> {
    let run = panic::catch_unwind(AssertUnwindSafe(|| run_intents(name, intents, &mut session)));

    let result = match run {
        Ok(result) => result,
        Err(payload) => {
            if let Err(e) = session.close(false) {
                warn!(batch = name, error = %e, "close after panic failed");
            }
            panic::resume_unwind(payload);
        }
    };

    let closed = session.close(result.is_ok());
    match (result, closed) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(source)) => Err(BatchError::Close {
            name: name.to_string(),
            source,
        }),
        (Err(err), Err(close_err)) => {
            // The statement failure is the one worth reporting.
            warn!(batch = name, error = %close_err, "close after failed batch also failed");
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
    }
}

fn run_intents<S: BatchSession>(
    name: &str,
    intents: &[WriteIntent],
    session: &mut S,
) -> Result<BatchOutcome, BatchError> {
    let mut affected = Vec::with_capacity(intents.len());
    for (index, intent) in intents.iter().enumerate() {
        let rows = session
            .exec(index, intent)
            .map_err(|source| BatchError::statement(name, index, source))?;
        debug!(batch = name, index, label = intent.label, rows, "statement applied");
        affected.push(rows);
    }
    Ok(BatchOutcome { affected })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubmitMode {
    /// The whole batch runs inside one `BEGIN IMMEDIATE` transaction.
    #[default]
    Atomic,
    /// Every statement autocommits on its own. If statement `k` fails,
    /// statements `0..k` stay applied; callers must tolerate partial batches.
    Pipelined,
}

pub struct SqliteSession<'a> {
    conn: &'a Connection,
    mode: SubmitMode,
}

impl<'a> SqliteSession<'a> {
    pub fn begin(conn: &'a Connection, mode: SubmitMode) -> Result<Self, StorageError> {
        if mode == SubmitMode::Atomic {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(Self { conn, mode })
    }
}

impl BatchSession for SqliteSession<'_> {
    fn exec(&mut self, _index: usize, intent: &WriteIntent) -> Result<usize, StorageError> {
        let mut stmt = self.conn.prepare_cached(&intent.sql)?;
        Ok(stmt.execute(rusqlite::params_from_iter(intent.params.iter()))?)
    }

    fn close(self, ok: bool) -> Result<(), StorageError> {
        if self.mode == SubmitMode::Pipelined {
            return Ok(());
        }
        if !ok {
            self.conn.execute_batch("ROLLBACK")?;
            return Ok(());
        }
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            // A failed COMMIT can leave the transaction open.
            if !self.conn.is_autocommit() {
                let _ = self.conn.execute_batch("ROLLBACK");
            }
            return Err(e.into());
        }
        Ok(())
    }
}
