//! Per-entity write intents.
//!
//! Each builder produces one atomic statement. Upserts are rendered once from
//! the merge rule tables so every batch compiles to the same cached SQL text.

use std::sync::LazyLock;

use rusqlite::types::Value;
use serde::Serialize;

use fleetsync_core::device::DEVICE_MERGE_RULES;
use fleetsync_core::identifier::IDENTIFIER_MERGE_RULES;
use fleetsync_core::merge::{ColumnRule, MergeRule, render_conflict_clause, rule};
use fleetsync_core::sighting::{
    EVENT_CREATED, EVENT_PROMOTED, FINGERPRINT_MERGE_RULES, SIGHTING_CONFLICT_TARGET, SIGHTING_MERGE_RULES,
    SYSTEM_ACTOR,
};
use fleetsync_core::{
    DeviceIdentifier, DeviceRecord, Fingerprint, FingerprintHash, SightingEvent, SightingId,
    SightingObservation, SubnetPolicy, Timestamp,
};

use crate::batch::WriteIntent;
use crate::error::StorageError;

const DEVICE_COLUMNS: &[&str] = &[
    "uid",
    "type_id",
    "name",
    "vendor_name",
    "model",
    "hostname",
    "ip",
    "mac",
    "domain",
    "risk_level",
    "risk_score",
    "is_managed",
    "is_available",
    "os",
    "hw_info",
    "owner",
    "org",
    "network_interfaces",
    "discovery_sources",
    "capabilities",
    "metadata",
    "first_seen",
    "last_seen",
    "created_time",
    "modified_time",
];

const IDENTIFIER_COLUMNS: &[&str] = &[
    "device_id",
    "id_type",
    "id_value",
    "partition",
    "confidence",
    "source",
    "first_seen",
    "last_seen",
    "verified",
    "metadata",
];

const SIGHTING_COLUMNS: &[&str] = &[
    "sighting_id",
    "partition",
    "ip",
    "subnet_id",
    "source",
    "status",
    "first_seen",
    "last_seen",
    "ttl_expires_at",
    "fingerprint_id",
    "metadata",
];

const FINGERPRINT_COLUMNS: &[&str] = &["fingerprint_id", "os_guess", "open_ports", "first_seen", "last_seen"];

const SUBNET_POLICY_COLUMNS: &[&str] = &[
    "subnet_id",
    "cidr",
    "classification",
    "sighting_ttl_secs",
    "allow_ip_as_id",
    "created_at",
    "updated_at",
];

const SUBNET_POLICY_RULES: &[ColumnRule] = &[
    rule("cidr", MergeRule::Overwrite),
    rule("classification", MergeRule::Overwrite),
    rule("sighting_ttl_secs", MergeRule::Overwrite),
    rule("allow_ip_as_id", MergeRule::Overwrite),
    rule("updated_at", MergeRule::Overwrite),
];

/// Stored mapping must already point at the incoming device for the update
/// to fire; otherwise the statement affects zero rows.
pub const IDENTIFIER_OWNER_GUARD: &str = "WHERE device_identifiers.device_id = excluded.device_id";

fn insert_sql(table: &str, columns: &[&str], conflict: &str) -> String {
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})\n{conflict}",
        columns.join(", ")
    )
}

pub static DEVICE_UPSERT_SQL: LazyLock<String> = LazyLock::new(|| {
    insert_sql(
        "devices",
        DEVICE_COLUMNS,
        &render_conflict_clause("devices", "(uid)", DEVICE_MERGE_RULES),
    )
});

pub static IDENTIFIER_UPSERT_SQL: LazyLock<String> = LazyLock::new(|| {
    let conflict = render_conflict_clause(
        "device_identifiers",
        "(id_type, id_value, partition)",
        IDENTIFIER_MERGE_RULES,
    );
    insert_sql(
        "device_identifiers",
        IDENTIFIER_COLUMNS,
        &format!("{conflict}\n{IDENTIFIER_OWNER_GUARD}"),
    )
});

/// Same statement as [`IDENTIFIER_UPSERT_SQL`], reporting the owning device
/// when the row was written.
pub static IDENTIFIER_UPSERT_RETURNING_SQL: LazyLock<String> =
    LazyLock::new(|| format!("{}\nRETURNING device_id", *IDENTIFIER_UPSERT_SQL));

pub static SIGHTING_UPSERT_SQL: LazyLock<String> = LazyLock::new(|| {
    insert_sql(
        "network_sightings",
        SIGHTING_COLUMNS,
        &render_conflict_clause("network_sightings", SIGHTING_CONFLICT_TARGET, SIGHTING_MERGE_RULES),
    )
});

pub static FINGERPRINT_UPSERT_SQL: LazyLock<String> = LazyLock::new(|| {
    insert_sql(
        "fingerprints",
        FINGERPRINT_COLUMNS,
        &render_conflict_clause("fingerprints", "(fingerprint_id)", FINGERPRINT_MERGE_RULES),
    )
});

pub static SUBNET_POLICY_UPSERT_SQL: LazyLock<String> = LazyLock::new(|| {
    insert_sql(
        "subnet_policies",
        SUBNET_POLICY_COLUMNS,
        &render_conflict_clause("subnet_policies", "(subnet_id)", SUBNET_POLICY_RULES),
    )
});

pub const MARK_PROMOTED_SQL: &str = "UPDATE network_sightings SET status = 'promoted'
WHERE status = 'active' AND sighting_id IN (SELECT value FROM json_each(?1))";

pub const PURGE_EXPIRED_SQL: &str =
    "DELETE FROM network_sightings WHERE status = 'expired' AND last_seen < ?1";

pub const DELETE_SUBNET_POLICY_SQL: &str = "DELETE FROM subnet_policies WHERE subnet_id = ?1";

pub const SIGHTING_EVENT_INSERT_SQL: &str = "INSERT INTO sighting_events
    (sighting_id, device_id, event_type, actor, details, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

/// Inserts the `created` event only when `?1` names a row, which holds only
/// if the preceding sighting upsert inserted rather than refreshed.
pub const SIGHTING_CREATED_EVENT_SQL: &str = "INSERT INTO sighting_events
    (sighting_id, event_type, actor, details, created_at)
SELECT sighting_id, ?2, ?3, json_object('partition', partition, 'ip', ip, 'source', source), first_seen
FROM network_sightings
WHERE sighting_id = ?1
  AND NOT EXISTS (SELECT 1 FROM sighting_events e WHERE e.sighting_id = ?1 AND e.event_type = ?2)";

/// Must run before [`MARK_PROMOTED_SQL`] in the same batch: it selects the
/// rows that are still active.
pub const SIGHTING_PROMOTED_EVENTS_SQL: &str = "INSERT INTO sighting_events
    (sighting_id, event_type, actor, details, created_at)
SELECT s.sighting_id, ?2, ?3, json_object('partition', s.partition, 'ip', s.ip), ?4
FROM network_sightings s
WHERE s.status = 'active'
  AND s.sighting_id IN (SELECT value FROM json_each(?1))
  AND NOT EXISTS (
      SELECT 1 FROM sighting_events e WHERE e.sighting_id = s.sighting_id AND e.event_type = ?2
  )";

fn text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

fn json<T: Serialize + ?Sized>(value: &T) -> Result<Value, StorageError> {
    Ok(Value::Text(serde_json::to_string(value)?))
}

fn json_opt<T: Serialize>(value: Option<&T>) -> Result<Value, StorageError> {
    value.map_or(Ok(Value::Null), json)
}

pub fn device_upsert(device: &DeviceRecord, now: Timestamp) -> Result<WriteIntent, StorageError> {
    let params = vec![
        Value::Text(device.uid.trim().to_string()),
        Value::Integer(i64::from(device.type_id)),
        text(device.name.as_deref()),
        text(device.vendor_name.as_deref()),
        text(device.model.as_deref()),
        text(device.hostname.as_deref()),
        text(device.ip.as_deref()),
        text(device.mac.as_deref()),
        text(device.domain.as_deref()),
        text(device.risk_level.as_deref()),
        int(device.risk_score.map(i64::from)),
        int(device.is_managed.map(i64::from)),
        Value::Integer(i64::from(device.is_available)),
        json_opt(device.os.as_ref())?,
        json_opt(device.hw_info.as_ref())?,
        json_opt(device.owner.as_ref())?,
        json_opt(device.org.as_ref())?,
        json(&device.network_interfaces)?,
        json(&device.discovery_sources)?,
        json(&device.capabilities)?,
        json(&device.metadata)?,
        int(device.first_seen),
        int(device.last_seen),
        Value::Integer(now),
        Value::Integer(now),
    ];
    Ok(WriteIntent::new("device", DEVICE_UPSERT_SQL.as_str(), params))
}

pub(crate) fn identifier_params(id: &DeviceIdentifier) -> Result<Vec<Value>, StorageError> {
    Ok(vec![
        Value::Text(id.device_id.clone()),
        Value::Text(id.id_type.clone()),
        Value::Text(id.id_value.clone()),
        Value::Text(id.partition.clone()),
        Value::Text(id.confidence.clone()),
        Value::Text(id.source.clone()),
        Value::Integer(id.first_seen),
        Value::Integer(id.last_seen),
        Value::Integer(i64::from(id.verified)),
        json(&id.metadata)?,
    ])
}

/// Conditional identifier upsert. Affects zero rows when the triple is
/// already mapped to a different device.
pub fn identifier_upsert(id: &DeviceIdentifier) -> Result<WriteIntent, StorageError> {
    Ok(WriteIntent::new(
        "identifier",
        IDENTIFIER_UPSERT_SQL.as_str(),
        identifier_params(id)?,
    ))
}

pub fn fingerprint_upsert(fingerprint: &Fingerprint, seen_at: Timestamp) -> Result<WriteIntent, StorageError> {
    let params = vec![
        Value::Text(fingerprint.hash().to_hex()),
        Value::Text(fingerprint.os_guess.clone()),
        json(&fingerprint.open_ports)?,
        Value::Integer(seen_at),
        Value::Integer(seen_at),
    ];
    Ok(WriteIntent::new("fingerprint", FINGERPRINT_UPSERT_SQL.as_str(), params))
}

/// Upserts the active sighting for the observation's (partition, ip).
///
/// `sighting_id` is only used when no active row exists yet.
pub fn sighting_upsert(
    sighting_id: SightingId,
    obs: &SightingObservation,
    ttl_expires_at: Option<Timestamp>,
    fingerprint_id: Option<FingerprintHash>,
) -> Result<WriteIntent, StorageError> {
    let params = vec![
        Value::Text(sighting_id.to_string()),
        Value::Text(obs.partition.clone()),
        Value::Text(obs.ip.clone()),
        text(obs.subnet_id.as_deref()),
        Value::Text(obs.source.clone()),
        Value::Text("active".to_string()),
        Value::Integer(obs.observed_at),
        Value::Integer(obs.observed_at),
        int(ttl_expires_at),
        text(fingerprint_id.map(|h| h.to_hex()).as_deref()),
        json(&obs.metadata)?,
    ];
    Ok(WriteIntent::new("sighting", SIGHTING_UPSERT_SQL.as_str(), params))
}

pub fn subnet_policy_upsert(policy: &SubnetPolicy, now: Timestamp) -> Result<WriteIntent, StorageError> {
    let ttl = policy
        .sighting_ttl_secs
        .map(|secs| i64::try_from(secs).unwrap_or(i64::MAX));
    let params = vec![
        Value::Text(policy.subnet_id.trim().to_string()),
        Value::Text(policy.cidr.trim().to_string()),
        Value::Text(policy.classification.clone()),
        int(ttl),
        Value::Integer(i64::from(policy.allow_ip_as_id)),
        Value::Integer(now),
        Value::Integer(now),
    ];
    Ok(WriteIntent::new("subnet_policy", SUBNET_POLICY_UPSERT_SQL.as_str(), params))
}

pub fn delete_subnet_policy(subnet_id: &str) -> WriteIntent {
    WriteIntent::new(
        "subnet_policy_delete",
        DELETE_SUBNET_POLICY_SQL,
        vec![Value::Text(subnet_id.to_string())],
    )
}

pub fn mark_promoted(ids: &[SightingId]) -> Result<WriteIntent, StorageError> {
    let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
    Ok(WriteIntent::new("mark_promoted", MARK_PROMOTED_SQL, vec![json(&ids)?]))
}

pub fn purge_expired(older_than: Timestamp) -> WriteIntent {
    WriteIntent::new("purge_expired", PURGE_EXPIRED_SQL, vec![Value::Integer(older_than)])
}

/// Expects an event already passed through [`SightingEvent::normalized`].
pub fn sighting_event(event: &SightingEvent) -> Result<WriteIntent, StorageError> {
    let params = vec![
        Value::Text(event.sighting_id.to_string()),
        text(event.device_id.as_deref()),
        Value::Text(event.event_type.clone()),
        Value::Text(event.actor.clone()),
        json(&event.details)?,
        Value::Integer(event.created_at),
    ];
    Ok(WriteIntent::new("sighting_event", SIGHTING_EVENT_INSERT_SQL, params))
}

/// Queue directly after the [`sighting_upsert`] that used `sighting_id`.
pub fn sighting_created_event(sighting_id: SightingId) -> WriteIntent {
    WriteIntent::new(
        "sighting_created_event",
        SIGHTING_CREATED_EVENT_SQL,
        vec![
            Value::Text(sighting_id.to_string()),
            Value::Text(EVENT_CREATED.to_string()),
            Value::Text(SYSTEM_ACTOR.to_string()),
        ],
    )
}

pub fn sighting_promoted_events(ids: &[SightingId], now: Timestamp) -> Result<WriteIntent, StorageError> {
    let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
    Ok(WriteIntent::new(
        "sighting_promoted_events",
        SIGHTING_PROMOTED_EVENTS_SQL,
        vec![
            json(&ids)?,
            Value::Text(EVENT_PROMOTED.to_string()),
            Value::Text(SYSTEM_ACTOR.to_string()),
            Value::Integer(now),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_sql_has_one_placeholder_per_column() {
        let device = DeviceRecord::new("sr:1");
        let intent = device_upsert(&device, 1).unwrap();
        assert_eq!(intent.params.len(), DEVICE_COLUMNS.len());
        assert!(intent.sql.contains(&format!("?{}", DEVICE_COLUMNS.len())));
        assert!(intent.sql.contains("ON CONFLICT (uid) DO UPDATE SET"));
        assert!(intent.sql.contains("hostname = COALESCE(NULLIF(excluded.hostname, ''), devices.hostname)"));
        // Insert-only columns never appear in the update list.
        assert!(!intent.sql.contains("created_time = "));
    }

    #[test]
    fn identifier_sql_is_guarded() {
        assert!(IDENTIFIER_UPSERT_SQL.ends_with(IDENTIFIER_OWNER_GUARD));
        assert!(!IDENTIFIER_UPSERT_SQL.contains("device_id = excluded.device_id,"));
        assert!(IDENTIFIER_UPSERT_RETURNING_SQL.ends_with("RETURNING device_id"));
    }

    #[test]
    fn sighting_sql_targets_active_row() {
        assert!(SIGHTING_UPSERT_SQL.contains("ON CONFLICT (partition, ip) WHERE status = 'active' DO UPDATE SET"));
        assert!(SIGHTING_UPSERT_SQL.contains(
            "fingerprint_id = COALESCE(network_sightings.fingerprint_id, excluded.fingerprint_id)"
        ));
    }
}
