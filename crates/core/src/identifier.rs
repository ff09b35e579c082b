use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Timestamp;
use crate::error::CoreError;
use crate::merge::{ColumnRule, MergeRule, rule};

pub const DEFAULT_PARTITION: &str = "default";
pub const DEFAULT_CONFIDENCE: &str = "weak";

pub const ID_TYPE_ARMIS: &str = "armis_device_id";
pub const ID_TYPE_INTEGRATION: &str = "integration_id";
pub const ID_TYPE_NETBOX: &str = "netbox_device_id";
pub const ID_TYPE_MAC: &str = "mac";

/// Lookup order when several strong identifiers are present.
pub const STRONG_IDENTIFIER_PRIORITY: [&str; 4] =
    [ID_TYPE_ARMIS, ID_TYPE_INTEGRATION, ID_TYPE_NETBOX, ID_TYPE_MAC];

/// Conflict resolution for `device_identifiers`. `device_id` is absent on
/// purpose: the upsert only fires when the stored mapping already points at
/// the incoming device.
pub const IDENTIFIER_MERGE_RULES: &[ColumnRule] = &[
    rule("confidence", MergeRule::PreferNonEmpty),
    rule("source", MergeRule::PreferNonEmpty),
    rule("first_seen", MergeRule::Earliest),
    rule("last_seen", MergeRule::Latest),
    rule("verified", MergeRule::AnyTrue),
    rule("metadata", MergeRule::ShallowMerge),
];

/// Maps one external identifier within a partition to a canonical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentifier {
    pub device_id: String,
    pub id_type: String,
    pub id_value: String,
    pub partition: String,
    pub confidence: String,
    pub source: String,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub verified: bool,
    pub metadata: Map<String, Value>,
}

impl DeviceIdentifier {
    pub fn new(
        device_id: impl Into<String>,
        id_type: impl Into<String>,
        id_value: impl Into<String>,
        partition: impl Into<String>,
        seen_at: Timestamp,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            id_type: id_type.into(),
            id_value: id_value.into(),
            partition: partition.into(),
            confidence: String::new(),
            source: String::new(),
            first_seen: seen_at,
            last_seen: seen_at,
            verified: false,
            metadata: Map::new(),
        }
    }

    /// Trims key fields, canonicalises the value for its type, applies
    /// defaults, and rejects incomplete mappings.
    pub fn normalized(mut self) -> Result<Self, CoreError> {
        self.device_id = required(&self.device_id, "device_id")?;
        self.id_type = required(&self.id_type, "id_type")?;
        self.id_value = required(&normalize_id_value(&self.id_type, &self.id_value), "id_value")?;
        self.partition = normalize_partition(&self.partition);
        self.confidence = match self.confidence.trim() {
            "" => DEFAULT_CONFIDENCE.to_string(),
            c => c.to_string(),
        };
        self.source = self.source.trim().to_string();
        if self.last_seen < self.first_seen {
            self.last_seen = self.first_seen;
        }
        Ok(self)
    }
}

fn required(value: &str, field: &'static str) -> Result<String, CoreError> {
    match value.trim() {
        "" => Err(CoreError::validation("device identifier", format!("{field} missing"))),
        v => Ok(v.to_string()),
    }
}

/// Blank partitions collapse into [`DEFAULT_PARTITION`].
pub fn normalize_partition(partition: &str) -> String {
    match partition.trim() {
        "" => DEFAULT_PARTITION.to_string(),
        p => p.to_string(),
    }
}

/// Uppercase hex with `:`, `-` and `.` separators removed, so every
/// collector's spelling of one address maps to the same key.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Canonical form of `value` as stored under `id_type`.
pub fn normalize_id_value(id_type: &str, value: &str) -> String {
    if id_type.trim() == ID_TYPE_MAC {
        normalize_mac(value)
    } else {
        value.trim().to_string()
    }
}

/// Strong identifiers extracted from one device observation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrongIdentifiers {
    pub armis_id: Option<String>,
    pub integration_id: Option<String>,
    pub netbox_id: Option<String>,
    pub mac: Option<String>,
    pub partition: String,
}

impl StrongIdentifiers {
    /// Present identifiers as `(id_type, value)` in priority order, each in
    /// its canonical form.
    pub fn present(&self) -> Vec<(&'static str, String)> {
        let mac = self.mac.as_deref().map(normalize_mac);
        [
            (ID_TYPE_ARMIS, self.armis_id.clone()),
            (ID_TYPE_INTEGRATION, self.integration_id.clone()),
            (ID_TYPE_NETBOX, self.netbox_id.clone()),
            (ID_TYPE_MAC, mac),
        ]
        .into_iter()
        .filter_map(|(t, v)| {
            let v = v?.trim().to_string();
            (!v.is_empty()).then_some((t, v))
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.present().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_fills_defaults() {
        let id = DeviceIdentifier::new(" D1 ", "mac", "aa:bb:cc", "  ", 10)
            .normalized()
            .unwrap();
        assert_eq!(id.device_id, "D1");
        assert_eq!(id.partition, DEFAULT_PARTITION);
        assert_eq!(id.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(id.id_value, "AABBCC");
    }

    #[test]
    fn mac_spellings_collapse() {
        for spelling in ["AA:BB:CC:DD:EE:FF", "aa-bb-cc-dd-ee-ff", "aabb.ccdd.eeff", " aabbccddeeff "] {
            assert_eq!(normalize_mac(spelling), "AABBCCDDEEFF");
        }
        assert_eq!(normalize_id_value(ID_TYPE_MAC, "aa:bb"), "AABB");
        assert_eq!(normalize_id_value(ID_TYPE_ARMIS, " ab-12 "), "ab-12");

        let err = DeviceIdentifier::new("D1", ID_TYPE_MAC, ":-.", "p", 0).normalized().unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn missing_fields_are_validation_errors() {
        for (dev, ty, val) in [("", "mac", "x"), ("D1", " ", "x"), ("D1", "mac", "")] {
            let err = DeviceIdentifier::new(dev, ty, val, "p", 0).normalized().unwrap_err();
            assert!(matches!(err, CoreError::Validation { .. }), "{err}");
        }
    }

    #[test]
    fn strong_identifiers_follow_priority() {
        let ids = StrongIdentifiers {
            mac: Some("AA:BB:CC".into()),
            armis_id: Some("123".into()),
            netbox_id: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(
            ids.present(),
            vec![(ID_TYPE_ARMIS, "123".to_string()), (ID_TYPE_MAC, "AABBCC".to_string())]
        );
        assert!(StrongIdentifiers::default().is_empty());
    }
}
