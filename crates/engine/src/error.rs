use fleetsync_core::CoreError;
use fleetsync_storage::StorageError;
use thiserror::Error;

use crate::retry::RetryError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error("{id_type}={id_value} in partition {partition} belongs to {existing}, not {incoming}")]
    IdentityConflict {
        id_type: String,
        id_value: String,
        partition: String,
        existing: String,
        incoming: String,
    },
}
