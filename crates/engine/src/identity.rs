use std::collections::HashMap;

use tracing::{debug, warn};

use fleetsync_core::clock::{Timestamp, now_ms};
use fleetsync_core::identifier::{normalize_id_value, normalize_partition};
use fleetsync_core::{CancelToken, DeviceIdentifier, StrongIdentifiers};
use fleetsync_storage::{BatchError, SqliteStore, intents};

use crate::error::EngineError;
use crate::retry::RetryController;

pub const STRONG_CONFIDENCE: &str = "strong";

/// An identifier write refused because the triple already maps elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConflict {
    pub id_type: String,
    pub id_value: String,
    pub partition: String,
    /// `None` if the owning row vanished between the write and the lookup.
    pub existing: Option<String>,
    pub incoming: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierReport {
    pub written: usize,
    pub skipped: usize,
    pub conflicts: Vec<IdentityConflict>,
}

/// Resolves external identifiers to canonical device ids and maintains the
/// mapping without ever reassigning an identifier to another device.
pub struct IdentityResolver<'a> {
    store: &'a SqliteStore,
    retry: &'a RetryController,
    cancel: &'a CancelToken,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a SqliteStore, retry: &'a RetryController, cancel: &'a CancelToken) -> Self {
        Self { store, retry, cancel }
    }

    /// Resolves one identifier. The value is canonicalised the same way
    /// writes are, so any spelling of a MAC finds its owner.
    pub fn lookup(&self, id_type: &str, value: &str, partition: &str) -> Result<Option<String>, EngineError> {
        let id_type = id_type.trim();
        let partition = normalize_partition(partition);
        let value = normalize_id_value(id_type, value);
        Ok(self.store.lookup_identifier(id_type, &value, &partition)?)
    }

    /// Resolves many values of one type in a single query. The result is
    /// keyed by the caller's spellings; unresolved values are absent.
    pub fn batch_lookup(
        &self,
        id_type: &str,
        values: &[String],
        partition: &str,
    ) -> Result<HashMap<String, String>, EngineError> {
        let id_type = id_type.trim();
        let partition = normalize_partition(partition);

        let mut spellings: HashMap<String, Vec<&String>> = HashMap::new();
        for value in values {
            let canonical = normalize_id_value(id_type, value);
            if !canonical.is_empty() {
                spellings.entry(canonical).or_default().push(value);
            }
        }
        let canonical: Vec<String> = spellings.keys().cloned().collect();
        let found = self.store.batch_lookup_identifiers(id_type, &canonical, &partition)?;

        let mut result = HashMap::with_capacity(found.len());
        for (value, device_id) in found {
            for original in spellings.remove(&value).unwrap_or_default() {
                result.insert(original.clone(), device_id.clone());
            }
        }
        Ok(result)
    }

    /// Maps one identifier to `device_id`, failing with
    /// [`EngineError::IdentityConflict`] if it already belongs to another
    /// device. The stored mapping is left untouched in that case.
    pub fn upsert(&self, device_id: &str, id_type: &str, value: &str, partition: &str) -> Result<(), EngineError> {
        let identifier = DeviceIdentifier::new(device_id, id_type, value, partition, now_ms()?);
        self.upsert_identifier(identifier)
    }

    pub fn upsert_identifier(&self, identifier: DeviceIdentifier) -> Result<(), EngineError> {
        let identifier = identifier.normalized()?;
        let store = self.store;
        let owner = self.retry.submit("identifier", self.cancel, || {
            store
                .upsert_identifier_returning(&identifier)
                .map_err(|e| BatchError::statement("identifier", 0, e))
        })?;
        if owner.is_some() {
            return Ok(());
        }

        let existing = self
            .store
            .lookup_identifier(&identifier.id_type, &identifier.id_value, &identifier.partition)?
            .unwrap_or_default();
        Err(EngineError::IdentityConflict {
            id_type: identifier.id_type,
            id_value: identifier.id_value,
            partition: identifier.partition,
            existing,
            incoming: identifier.device_id,
        })
    }

    /// Batch form of [`IdentityResolver::upsert_identifier`]. Invalid rows
    /// are skipped and conflicts are reported rather than aborting the batch.
    pub fn upsert_all(&self, identifiers: Vec<DeviceIdentifier>) -> Result<IdentifierReport, EngineError> {
        let mut report = IdentifierReport::default();
        let mut valid = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            match identifier.normalized() {
                Ok(id) => valid.push(id),
                Err(e) => {
                    warn!(error = %e, "skipping invalid device identifier");
                    report.skipped += 1;
                }
            }
        }
        if valid.is_empty() {
            return Ok(report);
        }

        let batch = valid
            .iter()
            .map(intents::identifier_upsert)
            .collect::<Result<Vec<_>, _>>()?;
        let store = self.store;
        let outcome = self
            .retry
            .submit("device_identifiers", self.cancel, || store.submit("device_identifiers", &batch))?;

        for (identifier, affected) in valid.into_iter().zip(outcome.affected) {
            if affected > 0 {
                report.written += 1;
                continue;
            }
            let existing =
                self.store
                    .lookup_identifier(&identifier.id_type, &identifier.id_value, &identifier.partition)?;
            warn!(
                id_type = %identifier.id_type,
                id_value = %identifier.id_value,
                partition = %identifier.partition,
                existing = existing.as_deref().unwrap_or(""),
                incoming = %identifier.device_id,
                "identifier already mapped to another device"
            );
            report.conflicts.push(IdentityConflict {
                id_type: identifier.id_type,
                id_value: identifier.id_value,
                partition: identifier.partition,
                existing,
                incoming: identifier.device_id,
            });
        }
        debug!(
            written = report.written,
            skipped = report.skipped,
            conflicts = report.conflicts.len(),
            "identifier batch applied"
        );
        Ok(report)
    }

    /// Upserts every strong identifier present on an observation, in
    /// priority order.
    pub fn register_device_identifiers(
        &self,
        device_id: &str,
        strong: &StrongIdentifiers,
        source: &str,
        seen_at: Timestamp,
    ) -> Result<IdentifierReport, EngineError> {
        let identifiers = strong
            .present()
            .into_iter()
            .map(|(id_type, value)| {
                let mut id = DeviceIdentifier::new(device_id, id_type, value, &strong.partition, seen_at);
                id.confidence = STRONG_CONFIDENCE.to_string();
                id.source = source.to_string();
                id
            })
            .collect();
        self.upsert_all(identifiers)
    }
}
