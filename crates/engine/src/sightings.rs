//! TTL lifecycle for low-confidence network sightings.
//!
//! active --(ttl passes, sweep)--> expired
//! active --(mark_promoted)------> promoted
//!
//! At most one active row exists per (partition, ip); re-observing refreshes
//! it in place. Expired rows stay behind as history until purged. Every
//! transition is logged to `sighting_events`, which purging leaves alone.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use fleetsync_core::clock::{Timestamp, add_ttl, now_ms};
use fleetsync_core::identifier::normalize_partition;
use fleetsync_core::sighting::canonical_ip;
use fleetsync_core::{
    CancelToken, ExpiredSighting, LifecycleConfig, NetworkSighting, SightingEvent, SightingId, SightingObservation,
    SubnetPolicy,
};
use fleetsync_storage::{BatchError, SqliteStore, WriteIntent, intents};

use crate::error::EngineError;
use crate::gate::WriteGate;
use crate::retry::RetryController;
use crate::writer::WriteReport;

pub const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserveReport {
    pub written: usize,
    pub skipped: usize,
    pub fingerprints: usize,
}

pub struct SightingLifecycle<'a> {
    store: &'a SqliteStore,
    retry: &'a RetryController,
    cancel: &'a CancelToken,
    gate: &'a WriteGate,
    config: &'a LifecycleConfig,
}

impl<'a> SightingLifecycle<'a> {
    pub fn new(
        store: &'a SqliteStore,
        retry: &'a RetryController,
        cancel: &'a CancelToken,
        gate: &'a WriteGate,
        config: &'a LifecycleConfig,
    ) -> Self {
        Self {
            store,
            retry,
            cancel,
            gate,
            config,
        }
    }

    /// Records sightings, creating or refreshing the active row for each
    /// (partition, ip). Fingerprints are written ahead of the sightings that
    /// reference them, in the same batch. A newly created row gets a
    /// `created` event.
    pub fn observe(&self, observations: Vec<SightingObservation>) -> Result<ObserveReport, EngineError> {
        let mut report = ObserveReport::default();
        let mut valid = Vec::with_capacity(observations.len());
        for obs in observations {
            match obs.normalized() {
                Ok(obs) => valid.push(obs),
                Err(e) => {
                    warn!(error = %e, "skipping invalid sighting");
                    report.skipped += 1;
                }
            }
        }
        if valid.is_empty() {
            return Ok(report);
        }

        let policies = self.load_policies(&mut valid)?;

        let mut batch: Vec<WriteIntent> = Vec::new();
        let mut seen_fingerprints = HashSet::new();
        for obs in &valid {
            if let Some(fp) = &obs.fingerprint {
                if seen_fingerprints.insert(fp.hash()) {
                    batch.push(intents::fingerprint_upsert(fp, obs.observed_at)?);
                }
            }
        }
        report.fingerprints = batch.len();

        for obs in &valid {
            let policy = obs.subnet_id.as_deref().and_then(|id| policies.get(id));
            let expires_at = self.ttl_for(obs, policy).map(|ttl| add_ttl(obs.observed_at, ttl));
            let fingerprint_id = obs.fingerprint.as_ref().map(|fp| fp.hash());
            let sighting_id = SightingId::new();
            batch.push(intents::sighting_upsert(sighting_id, obs, expires_at, fingerprint_id)?);
            batch.push(intents::sighting_created_event(sighting_id));
        }

        let _guard = self.gate.lock();
        let store = self.store;
        self.retry
            .submit("network_sightings", self.cancel, || store.submit("network_sightings", &batch))?;
        report.written = valid.len();
        debug!(written = report.written, skipped = report.skipped, "sightings observed");
        Ok(report)
    }

    /// Observation TTL, then the subnet policy's, then the lifecycle default.
    fn ttl_for(&self, obs: &SightingObservation, policy: Option<&SubnetPolicy>) -> Option<Duration> {
        obs.ttl
            .or_else(|| policy.and_then(|p| p.sighting_ttl_secs).map(Duration::from_secs))
            .or(self.config.default_ttl)
    }

    /// Loads the policies referenced by `observations`. References to
    /// unknown subnets are dropped so the foreign key cannot fail the batch.
    fn load_policies(
        &self,
        observations: &mut [SightingObservation],
    ) -> Result<HashMap<String, SubnetPolicy>, EngineError> {
        let mut policies = HashMap::new();
        let mut missing = HashSet::new();
        for obs in observations.iter_mut() {
            let Some(subnet_id) = obs.subnet_id.clone() else {
                continue;
            };
            if policies.contains_key(&subnet_id) {
                continue;
            }
            if !missing.contains(&subnet_id) {
                match self.store.get_subnet_policy(&subnet_id)? {
                    Some(policy) => {
                        policies.insert(subnet_id, policy);
                        continue;
                    }
                    None => {
                        warn!(subnet_id = %subnet_id, ip = %obs.ip, "sighting references unknown subnet");
                        missing.insert(subnet_id);
                    }
                }
            }
            obs.subnet_id = None;
        }
        Ok(policies)
    }

    /// Expires every active sighting whose TTL is at or before `now`, with an
    /// `expired` event for each. Running it again with the same `now` expires
    /// nothing.
    pub fn sweep(&self, now: Timestamp) -> Result<Vec<ExpiredSighting>, EngineError> {
        let _guard = self.gate.lock();
        let store = self.store;
        let expired = self.retry.submit("sighting_sweep", self.cancel, || {
            store
                .sweep_expired(now)
                .map_err(|e| BatchError::statement("sighting_sweep", 0, e))
        })?;
        if !expired.is_empty() {
            info!(count = expired.len(), now, "expired network sightings");
        }
        Ok(expired)
    }

    pub fn sweep_now(&self) -> Result<Vec<ExpiredSighting>, EngineError> {
        self.sweep(now_ms()?)
    }

    /// Active sightings first seen at or before `cutoff`; candidates for
    /// promotion to a device.
    pub fn list_promotable(&self, cutoff: Timestamp) -> Result<Vec<NetworkSighting>, EngineError> {
        Ok(self.store.list_promotable(cutoff)?)
    }

    /// Moves the given active sightings to promoted and logs a `promoted`
    /// event for each. Ids that are not active are ignored. Returns the
    /// number of rows changed.
    pub fn mark_promoted(&self, ids: &[SightingId]) -> Result<usize, EngineError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let batch = [
            intents::sighting_promoted_events(ids, now_ms()?)?,
            intents::mark_promoted(ids)?,
        ];
        let _guard = self.gate.lock();
        let store = self.store;
        let outcome = self
            .retry
            .submit("sighting_promote", self.cancel, || store.submit("sighting_promote", &batch))?;
        Ok(outcome.affected.last().copied().unwrap_or(0))
    }

    /// Appends caller-supplied audit events. Events with no type are skipped.
    pub fn record_events(&self, events: Vec<SightingEvent>) -> Result<WriteReport, EngineError> {
        let now = now_ms()?;
        let mut report = WriteReport::default();
        let mut batch = Vec::with_capacity(events.len());
        for event in events {
            match event.normalized(now) {
                Ok(event) => batch.push(intents::sighting_event(&event)?),
                Err(e) => {
                    warn!(error = %e, "skipping sighting event");
                    report.skipped += 1;
                }
            }
        }
        if batch.is_empty() {
            return Ok(report);
        }
        let store = self.store;
        self.retry
            .submit("sighting_events", self.cancel, || store.submit("sighting_events", &batch))?;
        report.written = batch.len();
        Ok(report)
    }

    /// Audit trail for one sighting, newest first. A zero `limit` means
    /// [`DEFAULT_EVENT_LIMIT`].
    pub fn list_events(&self, id: SightingId, limit: usize) -> Result<Vec<SightingEvent>, EngineError> {
        let limit = if limit == 0 { DEFAULT_EVENT_LIMIT } else { limit };
        Ok(self.store.list_sighting_events(id, limit)?)
    }

    /// Deletes expired sightings last seen before `older_than`.
    pub fn purge_expired(&self, older_than: Timestamp) -> Result<usize, EngineError> {
        let batch = [intents::purge_expired(older_than)];
        let _guard = self.gate.lock();
        let store = self.store;
        let outcome = self
            .retry
            .submit("sighting_purge", self.cancel, || store.submit("sighting_purge", &batch))?;
        let purged = outcome.total();
        if purged > 0 {
            info!(purged, older_than, "purged expired network sightings");
        }
        Ok(purged)
    }

    pub fn get(&self, id: SightingId) -> Result<Option<NetworkSighting>, EngineError> {
        Ok(self.store.get_sighting(id)?)
    }

    /// The active sighting for (partition, ip). Any spelling of the address
    /// finds the row; unparsable addresses are a validation error.
    pub fn active(&self, partition: &str, ip: &str) -> Result<Option<NetworkSighting>, EngineError> {
        let partition = normalize_partition(partition);
        let ip = canonical_ip(ip)?;
        Ok(self.store.active_sighting(&partition, &ip)?)
    }

    pub fn count_active(&self, partition: Option<&str>) -> Result<u64, EngineError> {
        let partition = partition.map(normalize_partition);
        Ok(self.store.count_active(partition.as_deref())?)
    }

    pub fn upsert_subnet_policy(&self, policy: &SubnetPolicy) -> Result<(), EngineError> {
        policy.validate()?;
        let batch = [intents::subnet_policy_upsert(policy, now_ms()?)?];
        let store = self.store;
        self.retry
            .submit("subnet_policy", self.cancel, || store.submit("subnet_policy", &batch))?;
        Ok(())
    }

    /// Removes a policy. Sightings that referenced it keep their rows with
    /// the reference cleared.
    pub fn delete_subnet_policy(&self, subnet_id: &str) -> Result<bool, EngineError> {
        let batch = [intents::delete_subnet_policy(subnet_id)];
        let store = self.store;
        let outcome = self
            .retry
            .submit("subnet_policy", self.cancel, || store.submit("subnet_policy", &batch))?;
        Ok(outcome.total() > 0)
    }
}
