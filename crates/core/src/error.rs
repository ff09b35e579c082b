use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid {record}: {reason}")]
    Validation {
        record: &'static str,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl CoreError {
    pub(crate) fn validation(record: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            record,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
