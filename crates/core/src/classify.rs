//! Backend error taxonomy.
//!
//! Classification looks for a structured backend error anywhere in the
//! `source()` chain first, then falls back to matching known phrases in the
//! rendered chain. Errors that cross library boundaries often lose their
//! structured form, so the fallback is not optional.

use std::error::Error;
use std::fmt;

use thiserror::Error;

pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// Raised by graph extensions for lock contention.
pub const SQLSTATE_INTERNAL_ERROR: &str = "XX000";
pub const SQLSTATE_STATEMENT_TIMEOUT: &str = "57014";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Deadlock,
    Serialization,
    InternalContention,
    Timeout,
    Other,
}

impl ErrorClass {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Other)
    }

    /// Errors caused by competing writers; these back off further.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::Deadlock | Self::Serialization)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deadlock => "deadlock",
            Self::Serialization => "serialization",
            Self::InternalContention => "internal_contention",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend code plus its class. `code` is empty when nothing was recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub code: String,
    pub class: ErrorClass,
}

impl Classification {
    pub fn new(code: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            code: code.into(),
            class,
        }
    }

    pub fn none() -> Self {
        Self::new("", ErrorClass::Other)
    }

    pub fn is_transient(&self) -> bool {
        self.class.is_transient()
    }
}

/// Maps backend failures onto [`ErrorClass`]. Implementations must return
/// [`Classification::none`] for `None`.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: Option<&(dyn Error + 'static)>) -> Classification;
}

/// Structured error carrying a SQLSTATE, as produced by Postgres-family
/// session providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (SQLSTATE {code})")]
pub struct SqlStateError {
    pub code: String,
    pub message: String,
}

impl SqlStateError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Classifier for SQLSTATE-speaking backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlStateClassifier;

impl ErrorClassifier for SqlStateClassifier {
    fn classify(&self, err: Option<&(dyn Error + 'static)>) -> Classification {
        let Some(err) = err else {
            return Classification::none();
        };
        if let Some(state) = chain(err).find_map(|e| e.downcast_ref::<SqlStateError>()) {
            return classify_sqlstate(&state.code);
        }
        classify_message(&chain_text(err))
    }
}

pub fn classify_sqlstate(code: &str) -> Classification {
    let class = match code {
        SQLSTATE_DEADLOCK_DETECTED => ErrorClass::Deadlock,
        SQLSTATE_SERIALIZATION_FAILURE => ErrorClass::Serialization,
        SQLSTATE_INTERNAL_ERROR => ErrorClass::InternalContention,
        SQLSTATE_STATEMENT_TIMEOUT => ErrorClass::Timeout,
        _ => ErrorClass::Other,
    };
    Classification::new(code, class)
}

const FALLBACK_PHRASES: &[(&[&str], &str, ErrorClass)] = &[
    (&["40p01", "deadlock detected"], SQLSTATE_DEADLOCK_DETECTED, ErrorClass::Deadlock),
    (&["40001", "could not serialize access"], SQLSTATE_SERIALIZATION_FAILURE, ErrorClass::Serialization),
    (&["xx000", "internal error"], SQLSTATE_INTERNAL_ERROR, ErrorClass::InternalContention),
    (&["57014", "statement timeout"], SQLSTATE_STATEMENT_TIMEOUT, ErrorClass::Timeout),
];

/// Case-insensitive phrase match over rendered error text.
pub fn classify_message(text: &str) -> Classification {
    let text = text.to_lowercase();
    FALLBACK_PHRASES
        .iter()
        .find(|(phrases, _, _)| phrases.iter().any(|p| text.contains(p)))
        .map(|(_, code, class)| Classification::new(*code, *class))
        .unwrap_or_else(Classification::none)
}

/// Iterates `err` and all of its sources, outermost first.
pub fn chain<'a>(err: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(err), |e: &&'a (dyn Error + 'static)| (*e).source())
}

/// Every message in the chain joined with `": "`.
pub fn chain_text(err: &(dyn Error + 'static)) -> String {
    chain(err).map(|e| e.to_string()).collect::<Vec<_>>().join(": ")
}
