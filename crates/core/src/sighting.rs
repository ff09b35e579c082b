use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Timestamp;
use crate::error::CoreError;
use crate::identifier::normalize_partition;
use crate::ids::{FingerprintHash, SightingId};
use crate::merge::{ColumnRule, MergeRule, rule};

/// Conflict target for sighting upserts: only the active row of a
/// (partition, ip) pair is unique.
pub const SIGHTING_CONFLICT_TARGET: &str = "(partition, ip) WHERE status = 'active'";

pub const SIGHTING_MERGE_RULES: &[ColumnRule] = &[
    rule("source", MergeRule::PreferNonEmpty),
    rule("last_seen", MergeRule::Overwrite),
    rule("ttl_expires_at", MergeRule::Overwrite),
    rule("metadata", MergeRule::ShallowMerge),
    // A resolved reference is never swapped for a newer guess.
    rule("fingerprint_id", MergeRule::KeepExisting),
    rule("subnet_id", MergeRule::KeepExisting),
];

pub const FINGERPRINT_MERGE_RULES: &[ColumnRule] = &[
    rule("os_guess", MergeRule::PreferNonEmpty),
    rule("open_ports", MergeRule::SetUnion),
    rule("first_seen", MergeRule::Earliest),
    rule("last_seen", MergeRule::Latest),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SightingStatus {
    Active,
    Expired,
    Promoted,
}

impl SightingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Promoted => "promoted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "promoted" => Ok(Self::Promoted),
            _ => Err(CoreError::InvalidData(format!("unknown sighting status: {s}"))),
        }
    }
}

/// Content-derived summary of OS and port signals shared by sightings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub os_guess: String,
    pub open_ports: Vec<u16>,
}

impl Fingerprint {
    pub fn new(os_guess: impl Into<String>, open_ports: impl IntoIterator<Item = u16>) -> Self {
        let mut open_ports: Vec<u16> = open_ports.into_iter().collect();
        open_ports.sort_unstable();
        open_ports.dedup();
        Self {
            os_guess: os_guess.into().trim().to_string(),
            open_ports,
        }
    }

    /// Hash of the canonical inputs; equal signals always share one row.
    pub fn hash(&self) -> FingerprintHash {
        let mut ports = self.open_ports.clone();
        ports.sort_unstable();
        ports.dedup();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"os:");
        hasher.update(self.os_guess.trim().to_lowercase().as_bytes());
        hasher.update(b"|ports:");
        for (i, port) in ports.iter().enumerate() {
            if i > 0 {
                hasher.update(b",");
            }
            hasher.update(port.to_string().as_bytes());
        }
        FingerprintHash::from_bytes(*hasher.finalize().as_bytes())
    }
}

/// Parses `ip` and renders it in its canonical text form.
pub fn canonical_ip(ip: &str) -> Result<String, CoreError> {
    ip.trim()
        .parse::<IpAddr>()
        .map(|addr| addr.to_string())
        .map_err(|_| CoreError::validation("sighting", format!("invalid ip {ip:?}")))
}

/// One low-confidence report of an IP address inside a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SightingObservation {
    pub partition: String,
    pub ip: String,
    pub subnet_id: Option<String>,
    pub source: String,
    pub observed_at: Timestamp,
    /// Overrides the subnet policy and lifecycle default when set.
    pub ttl: Option<Duration>,
    pub fingerprint: Option<Fingerprint>,
    pub metadata: Map<String, Value>,
}

impl SightingObservation {
    pub fn new(partition: impl Into<String>, ip: impl Into<String>, observed_at: Timestamp) -> Self {
        Self {
            partition: partition.into(),
            ip: ip.into(),
            subnet_id: None,
            source: String::new(),
            observed_at,
            ttl: None,
            fingerprint: None,
            metadata: Map::new(),
        }
    }

    /// Canonicalises the partition and IP text; rejects unparsable addresses.
    pub fn normalized(mut self) -> Result<Self, CoreError> {
        self.ip = canonical_ip(&self.ip)?;
        self.partition = normalize_partition(&self.partition);
        self.source = self.source.trim().to_string();
        self.subnet_id = self
            .subnet_id
            .take()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSighting {
    pub sighting_id: SightingId,
    pub partition: String,
    pub ip: String,
    pub subnet_id: Option<String>,
    pub source: String,
    pub status: SightingStatus,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub ttl_expires_at: Option<Timestamp>,
    pub fingerprint_id: Option<FingerprintHash>,
    pub metadata: Map<String, Value>,
}

/// A sighting moved from active to expired by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSighting {
    pub sighting_id: SightingId,
    pub partition: String,
    pub ip: String,
    /// The row's `ttl_expires_at`.
    pub expires_at: Timestamp,
    /// The `now` of the sweep that moved it.
    pub swept_at: Timestamp,
}

pub const EVENT_CREATED: &str = "created";
pub const EVENT_EXPIRED: &str = "expired";
pub const EVENT_PROMOTED: &str = "promoted";
pub const SYSTEM_ACTOR: &str = "system";

/// One entry in a sighting's audit trail. Events outlive the sighting row,
/// so a purged sighting keeps its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SightingEvent {
    /// Assigned by storage; `None` until written.
    pub event_id: Option<i64>,
    pub sighting_id: SightingId,
    pub device_id: Option<String>,
    pub event_type: String,
    pub actor: String,
    pub details: Map<String, Value>,
    pub created_at: Timestamp,
}

impl SightingEvent {
    pub fn new(sighting_id: SightingId, event_type: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            event_id: None,
            sighting_id,
            device_id: None,
            event_type: event_type.into(),
            actor: String::new(),
            details: Map::new(),
            created_at,
        }
    }

    /// Rejects a blank event type. A blank actor becomes [`SYSTEM_ACTOR`],
    /// a blank device id becomes `None`, and a missing timestamp becomes `now`.
    pub fn normalized(mut self, now: Timestamp) -> Result<Self, CoreError> {
        self.event_type = self.event_type.trim().to_string();
        if self.event_type.is_empty() {
            return Err(CoreError::validation("sighting event", "event_type missing"));
        }
        self.actor = match self.actor.trim() {
            "" => SYSTEM_ACTOR.to_string(),
            a => a.to_string(),
        };
        self.device_id = self
            .device_id
            .take()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if self.created_at <= 0 {
            self.created_at = now;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetPolicy {
    pub subnet_id: String,
    pub cidr: String,
    pub classification: String,
    /// `None` falls back to the lifecycle default TTL.
    pub sighting_ttl_secs: Option<u64>,
    pub allow_ip_as_id: bool,
}

impl SubnetPolicy {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.subnet_id.trim().is_empty() {
            return Err(CoreError::validation("subnet policy", "subnet_id missing"));
        }
        if self.cidr.trim().is_empty() {
            return Err(CoreError::validation("subnet policy", "cidr missing"));
        }
        if self.sighting_ttl_secs == Some(0) {
            return Err(CoreError::validation("subnet policy", "sighting ttl must be positive"));
        }
        Ok(())
    }
}
