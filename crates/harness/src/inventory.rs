use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleetsync_core::clock::Timestamp;
use fleetsync_core::{DeviceRecord, RetryConfig, SightingObservation};
use fleetsync_engine::{InventoryWriter, RetryController, WriteGate};
use fleetsync_storage::{SqliteStore, StorageError, StoreConfig};
use tempfile::TempDir;

/// A throwaway on-disk inventory shared by any number of writers.
///
/// Each writer gets its own connection; all of them share one [`WriteGate`],
/// the way collector threads in one process do.
pub struct TestInventory {
    _dir: TempDir,
    path: PathBuf,
    pub gate: Arc<WriteGate>,
}

impl TestInventory {
    pub fn new() -> Result<Self, StorageError> {
        let dir = tempfile::tempdir().map_err(|e| StorageError::Backend(Box::new(e)))?;
        let path = dir.path().join("inventory.db");
        // Create the schema up front so concurrent writers never race on DDL.
        SqliteStore::open(&path, StoreConfig::default())?;
        Ok(Self {
            _dir: dir,
            path,
            gate: Arc::new(WriteGate::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> Result<SqliteStore, StorageError> {
        SqliteStore::open(&self.path, StoreConfig::default())
    }

    pub fn store_with(&self, config: StoreConfig) -> Result<SqliteStore, StorageError> {
        SqliteStore::open(&self.path, config)
    }

    /// Writer with fast backoff so retry-heavy tests stay quick.
    pub fn writer(&self) -> Result<InventoryWriter, StorageError> {
        let retry = RetryController::new(&fast_retry());
        Ok(InventoryWriter::new(self.store()?, retry, Arc::clone(&self.gate)))
    }

    pub fn writer_with(&self, store: SqliteStore, retry: RetryController) -> InventoryWriter {
        InventoryWriter::new(store, retry, Arc::clone(&self.gate))
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        lock_backoff: Duration::from_millis(5),
        transient_backoff: Duration::from_millis(2),
    }
}

pub fn device(uid: &str) -> DeviceRecord {
    DeviceRecord::new(uid)
}

pub fn observation(partition: &str, ip: &str, observed_at: Timestamp) -> SightingObservation {
    let mut obs = SightingObservation::new(partition, ip, observed_at);
    obs.source = "sweep".to_string();
    obs
}
