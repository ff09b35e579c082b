pub mod batch;
pub mod classify;
pub mod error;
pub mod functions;
pub mod intents;
pub mod schema;
pub mod sqlite;

pub use batch::{BatchError, BatchOutcome, BatchSession, SqliteSession, SubmitMode, WriteIntent, execute_batch};
pub use classify::SqliteClassifier;
pub use error::StorageError;
pub use sqlite::{SqliteStore, StoreConfig};
