use std::sync::Arc;

use tracing::{debug, warn};

use fleetsync_core::clock::now_ms;
use fleetsync_core::{CancelToken, DeviceIdentifier, DeviceRecord, LifecycleConfig};
use fleetsync_storage::{SqliteStore, intents};

use crate::error::EngineError;
use crate::gate::WriteGate;
use crate::identity::{IdentifierReport, IdentityResolver};
use crate::retry::RetryController;
use crate::sightings::SightingLifecycle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    pub skipped: usize,
}

/// Entry point for collectors: validates records, serializes heavy writes
/// through the shared [`WriteGate`], and submits batches with retry.
pub struct InventoryWriter {
    store: SqliteStore,
    retry: RetryController,
    gate: Arc<WriteGate>,
    lifecycle: LifecycleConfig,
    cancel: CancelToken,
}

impl InventoryWriter {
    pub fn new(store: SqliteStore, retry: RetryController, gate: Arc<WriteGate>) -> Self {
        Self {
            store,
            retry,
            gate,
            lifecycle: LifecycleConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn identity(&self) -> IdentityResolver<'_> {
        IdentityResolver::new(&self.store, &self.retry, &self.cancel)
    }

    pub fn sightings(&self) -> SightingLifecycle<'_> {
        SightingLifecycle::new(&self.store, &self.retry, &self.cancel, &self.gate, &self.lifecycle)
    }

    /// Merge-upserts devices keyed by `uid`. A device without `last_seen` is
    /// stamped with the current time.
    pub fn upsert_devices(&self, devices: Vec<DeviceRecord>) -> Result<WriteReport, EngineError> {
        let now = now_ms()?;
        let mut report = WriteReport::default();
        let mut batch = Vec::with_capacity(devices.len());
        for mut device in devices {
            if let Err(e) = device.validate() {
                warn!(uid = %device.uid, error = %e, "skipping invalid device");
                report.skipped += 1;
                continue;
            }
            device.last_seen.get_or_insert(now);
            batch.push(intents::device_upsert(&device, now)?);
        }
        if batch.is_empty() {
            return Ok(report);
        }

        let _guard = self.gate.lock();
        let store = &self.store;
        self.retry
            .submit("devices", &self.cancel, || store.submit("devices", &batch))?;
        report.written = batch.len();
        debug!(written = report.written, skipped = report.skipped, "devices upserted");
        Ok(report)
    }

    /// Writes identifier mappings. Mappings that would move an identifier to
    /// a different device are reported in [`IdentifierReport::conflicts`].
    pub fn upsert_identifiers(&self, identifiers: Vec<DeviceIdentifier>) -> Result<IdentifierReport, EngineError> {
        self.identity().upsert_all(identifiers)
    }
}
