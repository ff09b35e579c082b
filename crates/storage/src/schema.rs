use std::time::Duration;

use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection, busy_timeout: Duration) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
    ",
    )?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS devices (
    uid TEXT PRIMARY KEY CHECK (length(trim(uid)) > 0),
    type_id INTEGER NOT NULL DEFAULT 0,
    name TEXT,
    vendor_name TEXT,
    model TEXT,
    hostname TEXT,
    ip TEXT,
    mac TEXT,
    domain TEXT,
    risk_level TEXT,
    risk_score INTEGER,
    is_managed INTEGER,
    is_available INTEGER NOT NULL DEFAULT 0,
    os TEXT,
    hw_info TEXT,
    owner TEXT,
    org TEXT,
    network_interfaces TEXT NOT NULL DEFAULT '[]',
    discovery_sources TEXT NOT NULL DEFAULT '[]',
    capabilities TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    first_seen INTEGER,
    last_seen INTEGER,
    created_time INTEGER NOT NULL,
    modified_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_devices_ip ON devices (ip);

CREATE TABLE IF NOT EXISTS device_identifiers (
    id INTEGER PRIMARY KEY,
    device_id TEXT NOT NULL,
    id_type TEXT NOT NULL,
    id_value TEXT NOT NULL,
    partition TEXT NOT NULL DEFAULT 'default',
    confidence TEXT NOT NULL DEFAULT 'weak',
    source TEXT NOT NULL DEFAULT '',
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    UNIQUE (id_type, id_value, partition)
);
CREATE INDEX IF NOT EXISTS idx_identifiers_device ON device_identifiers (device_id);

CREATE TABLE IF NOT EXISTS subnet_policies (
    subnet_id TEXT PRIMARY KEY,
    cidr TEXT NOT NULL,
    classification TEXT NOT NULL DEFAULT '',
    sighting_ttl_secs INTEGER CHECK (sighting_ttl_secs IS NULL OR sighting_ttl_secs > 0),
    allow_ip_as_id INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fingerprints (
    fingerprint_id TEXT PRIMARY KEY CHECK (length(fingerprint_id) = 64),
    os_guess TEXT NOT NULL DEFAULT '',
    open_ports TEXT NOT NULL DEFAULT '[]',
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS network_sightings (
    sighting_id TEXT PRIMARY KEY,
    partition TEXT NOT NULL,
    ip TEXT NOT NULL,
    subnet_id TEXT REFERENCES subnet_policies (subnet_id) ON DELETE SET NULL,
    source TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'expired', 'promoted')),
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    ttl_expires_at INTEGER,
    fingerprint_id TEXT REFERENCES fingerprints (fingerprint_id) ON DELETE SET NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sightings_active
    ON network_sightings (partition, ip) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_sightings_expiry
    ON network_sightings (ttl_expires_at) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_sightings_status_seen
    ON network_sightings (status, last_seen);

CREATE TABLE IF NOT EXISTS sighting_events (
    event_id INTEGER PRIMARY KEY,
    sighting_id TEXT NOT NULL,
    device_id TEXT,
    event_type TEXT NOT NULL CHECK (length(trim(event_type)) > 0),
    actor TEXT NOT NULL DEFAULT 'system',
    details TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sighting_events_sighting
    ON sighting_events (sighting_id, created_at);
";
