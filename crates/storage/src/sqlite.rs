use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use fleetsync_core::sighting::{EVENT_EXPIRED, SYSTEM_ACTOR};
use fleetsync_core::{
    DeviceIdentifier, DeviceRecord, ExpiredSighting, Fingerprint, FingerprintHash, NetworkSighting,
    SightingEvent, SightingId, SightingStatus, SubnetPolicy, Timestamp,
};

use crate::batch::{BatchError, BatchOutcome, SqliteSession, SubmitMode, WriteIntent, execute_batch};
use crate::error::StorageError;
use crate::intents::{IDENTIFIER_UPSERT_RETURNING_SQL, SIGHTING_EVENT_INSERT_SQL, identifier_params};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub busy_timeout: Duration,
    pub mode: SubmitMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            mode: SubmitMode::Atomic,
        }
    }
}

/// One SQLite connection plus the inventory queries that run on it.
///
/// Writers on separate threads each open their own store on the same file.
pub struct SqliteStore {
    conn: Connection,
    config: StoreConfig,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StorageError> {
        Self::init(Connection::open(path)?, config)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?, StoreConfig::default())
    }

    fn init(conn: Connection, config: StoreConfig) -> Result<Self, StorageError> {
        crate::schema::init_schema(&conn, config.busy_timeout)?;
        crate::functions::register(&conn)?;
        Ok(Self { conn, config })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    /// Runs `intents` in the configured [`SubmitMode`].
    pub fn submit(&self, name: &str, intents: &[WriteIntent]) -> Result<BatchOutcome, BatchError> {
        let session = SqliteSession::begin(&self.conn, self.config.mode).map_err(|source| BatchError::Begin {
            name: name.to_string(),
            source,
        })?;
        execute_batch(name, intents, session)
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    pub fn get_device(&self, uid: &str) -> Result<Option<DeviceRecord>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT uid, type_id, name, vendor_name, model, hostname, ip, mac, domain, risk_level,
                    risk_score, is_managed, is_available, os, hw_info, owner, org,
                    network_interfaces, discovery_sources, capabilities, metadata, first_seen, last_seen
             FROM devices WHERE uid = ?1",
        )?;
        let row = stmt
            .query_row(rusqlite::params![uid], |row| {
                Ok(DeviceRow {
                    uid: row.get(0)?,
                    type_id: row.get(1)?,
                    name: row.get(2)?,
                    vendor_name: row.get(3)?,
                    model: row.get(4)?,
                    hostname: row.get(5)?,
                    ip: row.get(6)?,
                    mac: row.get(7)?,
                    domain: row.get(8)?,
                    risk_level: row.get(9)?,
                    risk_score: row.get(10)?,
                    is_managed: row.get(11)?,
                    is_available: row.get(12)?,
                    os: row.get(13)?,
                    hw_info: row.get(14)?,
                    owner: row.get(15)?,
                    org: row.get(16)?,
                    network_interfaces: row.get(17)?,
                    discovery_sources: row.get(18)?,
                    capabilities: row.get(19)?,
                    metadata: row.get(20)?,
                    first_seen: row.get(21)?,
                    last_seen: row.get(22)?,
                })
            })
            .optional()?;
        row.map(DeviceRow::into_record).transpose()
    }

    pub fn count_devices(&self) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Identifiers
    // ------------------------------------------------------------------

    pub fn lookup_identifier(
        &self,
        id_type: &str,
        id_value: &str,
        partition: &str,
    ) -> Result<Option<String>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT device_id FROM device_identifiers
             WHERE id_type = ?1 AND id_value = ?2 AND partition = ?3",
        )?;
        Ok(stmt
            .query_row(rusqlite::params![id_type, id_value, partition], |row| row.get(0))
            .optional()?)
    }

    /// Resolves many values of one identifier type in a single query. Values
    /// with no mapping are absent from the result.
    pub fn batch_lookup_identifiers(
        &self,
        id_type: &str,
        values: &[String],
        partition: &str,
    ) -> Result<HashMap<String, String>, StorageError> {
        if values.is_empty() {
            return Ok(HashMap::new());
        }
        let values = serde_json::to_string(values)?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT id_value, device_id FROM device_identifiers
             WHERE id_type = ?1 AND partition = ?3
               AND id_value IN (SELECT value FROM json_each(?2))",
        )?;
        let rows = stmt.query_map(rusqlite::params![id_type, values, partition], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut result = HashMap::new();
        for row in rows {
            let (value, device_id) = row?;
            result.insert(value, device_id);
        }
        Ok(result)
    }

    pub fn get_identifier(
        &self,
        id_type: &str,
        id_value: &str,
        partition: &str,
    ) -> Result<Option<DeviceIdentifier>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT device_id, id_type, id_value, partition, confidence, source,
                    first_seen, last_seen, verified, metadata
             FROM device_identifiers
             WHERE id_type = ?1 AND id_value = ?2 AND partition = ?3",
        )?;
        let row = stmt
            .query_row(rusqlite::params![id_type, id_value, partition], |row| {
                Ok((
                    DeviceIdentifier {
                        device_id: row.get(0)?,
                        id_type: row.get(1)?,
                        id_value: row.get(2)?,
                        partition: row.get(3)?,
                        confidence: row.get(4)?,
                        source: row.get(5)?,
                        first_seen: row.get(6)?,
                        last_seen: row.get(7)?,
                        verified: row.get(8)?,
                        metadata: Map::new(),
                    },
                    row.get::<_, String>(9)?,
                ))
            })
            .optional()?;
        row.map(|(mut id, metadata)| {
            id.metadata = parse_json(&metadata, "identifier metadata")?;
            Ok(id)
        })
        .transpose()
    }

    /// Runs the conditional identifier upsert on its own and returns the
    /// owning device when the row was written. `None` means the triple is
    /// mapped to another device and nothing changed.
    pub fn upsert_identifier_returning(&self, id: &DeviceIdentifier) -> Result<Option<String>, StorageError> {
        let params = identifier_params(id)?;
        let mut stmt = self.conn.prepare_cached(&IDENTIFIER_UPSERT_RETURNING_SQL)?;
        Ok(stmt
            .query_row(rusqlite::params_from_iter(params.iter()), |row| row.get(0))
            .optional()?)
    }

    pub fn identifiers_for_device(&self, device_id: &str) -> Result<Vec<(String, String, String)>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id_type, id_value, partition FROM device_identifiers
             WHERE device_id = ?1 ORDER BY id_type, id_value",
        )?;
        let rows = stmt.query_map(rusqlite::params![device_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------------------------------------------
    // Sightings
    // ------------------------------------------------------------------

    /// Expires every active sighting whose TTL has passed, in one statement,
    /// and records an `expired` event for each in the same transaction.
    pub fn sweep_expired(&self, now: Timestamp) -> Result<Vec<ExpiredSighting>, StorageError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let mut expired = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE network_sightings
                 SET status = 'expired', last_seen = MAX(last_seen, ?1)
                 WHERE status = 'active' AND ttl_expires_at IS NOT NULL AND ttl_expires_at <= ?1
                 RETURNING sighting_id, partition, ip, ttl_expires_at",
            )?;
            let rows = stmt.query_map(rusqlite::params![now], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            for row in rows {
                let (id, partition, ip, expires_at) = row?;
                expired.push(ExpiredSighting {
                    sighting_id: id.parse()?,
                    partition,
                    ip,
                    expires_at,
                    swept_at: now,
                });
            }
        }
        {
            let mut insert = tx.prepare_cached(SIGHTING_EVENT_INSERT_SQL)?;
            for sighting in &expired {
                let details = serde_json::json!({
                    "partition": sighting.partition,
                    "ip": sighting.ip,
                    "ttl_expires_at": sighting.expires_at,
                });
                insert.execute(rusqlite::params![
                    sighting.sighting_id.to_string(),
                    Option::<String>::None,
                    EVENT_EXPIRED,
                    SYSTEM_ACTOR,
                    details.to_string(),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(expired)
    }

    /// Audit events for one sighting, newest first.
    pub fn list_sighting_events(&self, id: SightingId, limit: usize) -> Result<Vec<SightingEvent>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT event_id, device_id, event_type, actor, details, created_at
             FROM sighting_events
             WHERE sighting_id = ?1
             ORDER BY created_at DESC, event_id DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(rusqlite::params![id.to_string(), limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (event_id, device_id, event_type, actor, details, created_at) = row?;
            events.push(SightingEvent {
                event_id: Some(event_id),
                sighting_id: id,
                device_id,
                event_type,
                actor,
                details: parse_json(&details, "sighting event details")?,
                created_at,
            });
        }
        Ok(events)
    }

    pub fn get_sighting(&self, id: SightingId) -> Result<Option<NetworkSighting>, StorageError> {
        let sql = format!("{SIGHTING_SELECT} WHERE sighting_id = ?1");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(rusqlite::params![id.to_string()], SightingRow::read)
            .optional()?;
        row.map(SightingRow::into_sighting).transpose()
    }

    pub fn active_sighting(&self, partition: &str, ip: &str) -> Result<Option<NetworkSighting>, StorageError> {
        let sql = format!("{SIGHTING_SELECT} WHERE partition = ?1 AND ip = ?2 AND status = 'active'");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(rusqlite::params![partition, ip], SightingRow::read)
            .optional()?;
        row.map(SightingRow::into_sighting).transpose()
    }

    /// Every sighting for (partition, ip), oldest first.
    pub fn sighting_history(&self, partition: &str, ip: &str) -> Result<Vec<NetworkSighting>, StorageError> {
        let sql = format!("{SIGHTING_SELECT} WHERE partition = ?1 AND ip = ?2 ORDER BY first_seen, sighting_id");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params![partition, ip], SightingRow::read)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?.into_sighting()?);
        }
        Ok(result)
    }

    /// Active sightings first seen at or before `cutoff`.
    pub fn list_promotable(&self, cutoff: Timestamp) -> Result<Vec<NetworkSighting>, StorageError> {
        let sql = format!("{SIGHTING_SELECT} WHERE status = 'active' AND first_seen <= ?1 ORDER BY first_seen");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::params![cutoff], SightingRow::read)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?.into_sighting()?);
        }
        Ok(result)
    }

    pub fn count_active(&self, partition: Option<&str>) -> Result<u64, StorageError> {
        let count: i64 = match partition {
            Some(p) => self.conn.query_row(
                "SELECT COUNT(*) FROM network_sightings WHERE status = 'active' AND partition = ?1",
                rusqlite::params![p],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM network_sightings WHERE status = 'active'",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Fingerprints and subnet policies
    // ------------------------------------------------------------------

    pub fn get_fingerprint(&self, hash: &FingerprintHash) -> Result<Option<(Fingerprint, Timestamp, Timestamp)>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT os_guess, open_ports, first_seen, last_seen FROM fingerprints WHERE fingerprint_id = ?1",
        )?;
        let row = stmt
            .query_row(rusqlite::params![hash.to_hex()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .optional()?;
        row.map(|(os_guess, ports, first_seen, last_seen)| {
            let ports: Vec<u16> = parse_json(&ports, "open_ports")?;
            Ok((Fingerprint::new(os_guess, ports), first_seen, last_seen))
        })
        .transpose()
    }

    pub fn get_subnet_policy(&self, subnet_id: &str) -> Result<Option<SubnetPolicy>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT subnet_id, cidr, classification, sighting_ttl_secs, allow_ip_as_id
             FROM subnet_policies WHERE subnet_id = ?1",
        )?;
        let row = stmt
            .query_row(rusqlite::params![subnet_id], |row| {
                let ttl: Option<i64> = row.get(3)?;
                Ok(SubnetPolicy {
                    subnet_id: row.get(0)?,
                    cidr: row.get(1)?,
                    classification: row.get(2)?,
                    sighting_ttl_secs: ttl.and_then(|t| u64::try_from(t).ok()),
                    allow_ip_as_id: row.get(4)?,
                })
            })
            .optional()?;
        Ok(row)
    }
}

const SIGHTING_SELECT: &str = "SELECT sighting_id, partition, ip, subnet_id, source, status,
        first_seen, last_seen, ttl_expires_at, fingerprint_id, metadata
 FROM network_sightings";

struct SightingRow {
    sighting_id: String,
    partition: String,
    ip: String,
    subnet_id: Option<String>,
    source: String,
    status: String,
    first_seen: i64,
    last_seen: i64,
    ttl_expires_at: Option<i64>,
    fingerprint_id: Option<String>,
    metadata: String,
}

impl SightingRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sighting_id: row.get(0)?,
            partition: row.get(1)?,
            ip: row.get(2)?,
            subnet_id: row.get(3)?,
            source: row.get(4)?,
            status: row.get(5)?,
            first_seen: row.get(6)?,
            last_seen: row.get(7)?,
            ttl_expires_at: row.get(8)?,
            fingerprint_id: row.get(9)?,
            metadata: row.get(10)?,
        })
    }

    fn into_sighting(self) -> Result<NetworkSighting, StorageError> {
        Ok(NetworkSighting {
            sighting_id: self.sighting_id.parse()?,
            partition: self.partition,
            ip: self.ip,
            subnet_id: self.subnet_id,
            source: self.source,
            status: SightingStatus::parse(&self.status)?,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            ttl_expires_at: self.ttl_expires_at,
            fingerprint_id: self.fingerprint_id.map(|h| h.parse()).transpose()?,
            metadata: parse_json(&self.metadata, "sighting metadata")?,
        })
    }
}

struct DeviceRow {
    uid: String,
    type_id: i32,
    name: Option<String>,
    vendor_name: Option<String>,
    model: Option<String>,
    hostname: Option<String>,
    ip: Option<String>,
    mac: Option<String>,
    domain: Option<String>,
    risk_level: Option<String>,
    risk_score: Option<i32>,
    is_managed: Option<bool>,
    is_available: bool,
    os: Option<String>,
    hw_info: Option<String>,
    owner: Option<String>,
    org: Option<String>,
    network_interfaces: String,
    discovery_sources: String,
    capabilities: String,
    metadata: String,
    first_seen: Option<i64>,
    last_seen: Option<i64>,
}

impl DeviceRow {
    fn into_record(self) -> Result<DeviceRecord, StorageError> {
        let object = |text: Option<String>, label: &str| -> Result<Option<Value>, StorageError> {
            text.map(|t| parse_json(&t, label)).transpose()
        };
        Ok(DeviceRecord {
            uid: self.uid,
            type_id: self.type_id,
            name: self.name,
            vendor_name: self.vendor_name,
            model: self.model,
            hostname: self.hostname,
            ip: self.ip,
            mac: self.mac,
            domain: self.domain,
            risk_level: self.risk_level,
            risk_score: self.risk_score,
            is_managed: self.is_managed,
            is_available: self.is_available,
            os: object(self.os, "os")?,
            hw_info: object(self.hw_info, "hw_info")?,
            owner: object(self.owner, "owner")?,
            org: object(self.org, "org")?,
            network_interfaces: parse_json(&self.network_interfaces, "network_interfaces")?,
            discovery_sources: parse_json(&self.discovery_sources, "discovery_sources")?,
            capabilities: parse_json(&self.capabilities, "capabilities")?,
            metadata: parse_json(&self.metadata, "metadata")?,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        })
    }
}

fn parse_json<T: DeserializeOwned>(text: &str, label: &str) -> Result<T, StorageError> {
    serde_json::from_str(text).map_err(|e| StorageError::Serialization(format!("{label}: {e}")))
}
