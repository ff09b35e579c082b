use std::error::Error;

use rusqlite::ErrorCode;
use rusqlite::ffi;

use fleetsync_core::classify::{
    Classification, ErrorClass, ErrorClassifier, SqlStateError, chain, chain_text, classify_message,
    classify_sqlstate,
};

pub const SQLITE_BUSY: &str = "SQLITE_BUSY";
pub const SQLITE_BUSY_SNAPSHOT: &str = "SQLITE_BUSY_SNAPSHOT";
pub const SQLITE_LOCKED: &str = "SQLITE_LOCKED";
pub const SQLITE_PROTOCOL: &str = "SQLITE_PROTOCOL";
pub const SQLITE_INTERRUPT: &str = "SQLITE_INTERRUPT";

const SQLITE_PHRASES: &[(&str, &str, ErrorClass)] = &[
    ("database table is locked", SQLITE_LOCKED, ErrorClass::Deadlock),
    ("database is locked", SQLITE_BUSY, ErrorClass::Deadlock),
];

/// Classifier for SQLite sessions.
///
/// Writer contention shows up as `SQLITE_BUSY`/`SQLITE_LOCKED` rather than a
/// deadlock code, so both map onto the lock-contention classes. SQLSTATE
/// errors reported by other providers are still recognised.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteClassifier;

impl ErrorClassifier for SqliteClassifier {
    fn classify(&self, err: Option<&(dyn Error + 'static)>) -> Classification {
        let Some(err) = err else {
            return Classification::none();
        };

        for e in chain(err) {
            if let Some(rusqlite::Error::SqliteFailure(failure, _)) = e.downcast_ref::<rusqlite::Error>() {
                return classify_failure(failure);
            }
            if let Some(state) = e.downcast_ref::<SqlStateError>() {
                return classify_sqlstate(&state.code);
            }
        }

        let text = chain_text(err);
        let lower = text.to_lowercase();
        SQLITE_PHRASES
            .iter()
            .find(|(phrase, _, _)| lower.contains(phrase))
            .map(|(_, code, class)| Classification::new(*code, *class))
            .unwrap_or_else(|| classify_message(&text))
    }
}

fn classify_failure(failure: &ffi::Error) -> Classification {
    if failure.extended_code == ffi::SQLITE_BUSY_SNAPSHOT {
        return Classification::new(SQLITE_BUSY_SNAPSHOT, ErrorClass::Serialization);
    }
    match failure.code {
        ErrorCode::DatabaseBusy => Classification::new(SQLITE_BUSY, ErrorClass::Deadlock),
        ErrorCode::DatabaseLocked => Classification::new(SQLITE_LOCKED, ErrorClass::Deadlock),
        ErrorCode::FileLockingProtocolFailed => {
            Classification::new(SQLITE_PROTOCOL, ErrorClass::InternalContention)
        }
        ErrorCode::OperationInterrupted => Classification::new(SQLITE_INTERRUPT, ErrorClass::Timeout),
        other => Classification::new(format!("{other:?}"), ErrorClass::Other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rusqlite::Connection;

    use crate::batch::BatchError;
    use crate::error::StorageError;

    fn failure(code: i32, msg: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), Some(msg.to_string()))
    }

    fn classify(err: &(dyn Error + 'static)) -> Classification {
        SqliteClassifier.classify(Some(err))
    }

    #[test]
    fn structured_codes() {
        let cases = [
            (ffi::SQLITE_BUSY, SQLITE_BUSY, ErrorClass::Deadlock),
            (ffi::SQLITE_BUSY_SNAPSHOT, SQLITE_BUSY_SNAPSHOT, ErrorClass::Serialization),
            (ffi::SQLITE_LOCKED, SQLITE_LOCKED, ErrorClass::Deadlock),
            (ffi::SQLITE_PROTOCOL, SQLITE_PROTOCOL, ErrorClass::InternalContention),
            (ffi::SQLITE_INTERRUPT, SQLITE_INTERRUPT, ErrorClass::Timeout),
        ];
        for (raw, code, class) in cases {
            let c = classify(&failure(raw, "x"));
            assert_eq!(c.code, code);
            assert_eq!(c.class, class);
        }
    }

    #[test]
    fn constraint_violation_is_permanent() {
        let c = classify(&failure(ffi::SQLITE_CONSTRAINT, "UNIQUE constraint failed"));
        assert!(!c.is_transient());
        assert_eq!(c.code, "ConstraintViolation");
    }

    #[test]
    fn found_through_batch_error() {
        let err = BatchError::statement("devices", 2, StorageError::Sqlite(failure(ffi::SQLITE_BUSY, "busy")));
        assert_eq!(classify(&err).class, ErrorClass::Deadlock);
    }

    #[test]
    fn sqlstate_from_other_backends() {
        let inner = StorageError::Backend(Box::new(SqlStateError::new("40001", "conflict")));
        let err = BatchError::statement("devices", 0, inner);
        assert_eq!(classify(&err).class, ErrorClass::Serialization);
    }

    #[test]
    fn message_fallback() {
        let err = StorageError::Serialization("database is locked".into());
        assert_eq!(classify(&err).code, SQLITE_BUSY);
        let err = StorageError::Serialization("database table is locked: devices".into());
        assert_eq!(classify(&err).code, SQLITE_LOCKED);
        let err = StorageError::Serialization("ERROR: deadlock detected".into());
        assert_eq!(classify(&err).code, "40P01");
        assert_eq!(SqliteClassifier.classify(None), Classification::none());
    }

    #[test]
    fn real_busy_error_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db");
        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("PRAGMA journal_mode = WAL; CREATE TABLE t (x INTEGER);").unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let contender = Connection::open(&path).unwrap();
        contender.busy_timeout(Duration::ZERO).unwrap();
        let err = contender.execute_batch("BEGIN IMMEDIATE").unwrap_err();
        let err = StorageError::from(err);

        let c = classify(&err);
        assert_eq!(c.code, SQLITE_BUSY);
        assert!(c.is_transient());
        assert!(c.class.is_lock_contention());

        holder.execute_batch("ROLLBACK").unwrap();
    }
}
