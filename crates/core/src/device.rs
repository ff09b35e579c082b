use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Timestamp;
use crate::error::CoreError;
use crate::merge::{self, ColumnRule, MergeRule, rule};

/// Conflict resolution for the `devices` table, keyed by `uid`.
///
/// `uid` and `created_time` are insert-only and therefore absent.
pub const DEVICE_MERGE_RULES: &[ColumnRule] = &[
    rule("type_id", MergeRule::PreferNonZero),
    rule("name", MergeRule::PreferNonEmpty),
    rule("vendor_name", MergeRule::PreferNonEmpty),
    rule("model", MergeRule::PreferNonEmpty),
    rule("hostname", MergeRule::PreferNonEmpty),
    rule("ip", MergeRule::PreferNonEmpty),
    rule("mac", MergeRule::PreferNonEmpty),
    rule("domain", MergeRule::PreferNonEmpty),
    rule("risk_level", MergeRule::PreferNonEmpty),
    rule("risk_score", MergeRule::PreferNonNull),
    rule("is_managed", MergeRule::PreferNonNull),
    rule("is_available", MergeRule::Overwrite),
    rule("os", MergeRule::ShallowMerge),
    rule("hw_info", MergeRule::ShallowMerge),
    rule("owner", MergeRule::ShallowMerge),
    rule("org", MergeRule::ShallowMerge),
    rule("network_interfaces", MergeRule::SetUnion),
    rule("discovery_sources", MergeRule::SetUnion),
    rule("capabilities", MergeRule::SetUnion),
    rule("metadata", MergeRule::ShallowMerge),
    rule("first_seen", MergeRule::Earliest),
    rule("last_seen", MergeRule::PreferNonNull),
    rule("modified_time", MergeRule::Overwrite),
];

/// Canonical device identity record.
///
/// Every nested object is independently optional; an absent value in an
/// observation means "not observed", never "cleared".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub uid: String,
    pub type_id: i32,
    pub name: Option<String>,
    pub vendor_name: Option<String>,
    pub model: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub domain: Option<String>,
    pub risk_level: Option<String>,
    pub risk_score: Option<i32>,
    pub is_managed: Option<bool>,
    pub is_available: bool,
    pub os: Option<Value>,
    pub hw_info: Option<Value>,
    pub owner: Option<Value>,
    pub org: Option<Value>,
    pub network_interfaces: Vec<Value>,
    pub discovery_sources: Vec<String>,
    pub capabilities: Vec<String>,
    pub metadata: Map<String, Value>,
    pub first_seen: Option<Timestamp>,
    pub last_seen: Option<Timestamp>,
}

impl DeviceRecord {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.uid.trim().is_empty() {
            return Err(CoreError::validation("device", "uid missing"));
        }
        for (field, value) in [("os", &self.os), ("hw_info", &self.hw_info), ("owner", &self.owner), ("org", &self.org)] {
            if let Some(v) = value {
                if !v.is_object() && !v.is_null() {
                    return Err(CoreError::validation("device", format!("{field} must be a JSON object")));
                }
            }
        }
        Ok(())
    }

    /// Applies `incoming` on top of `self` with the same semantics as the
    /// rendered SQL upsert. Used for in-process caches and to cross-check the
    /// backend path in tests.
    pub fn merge(&mut self, incoming: &DeviceRecord) {
        use crate::merge::prefer_non_empty as text;

        self.type_id = merge::prefer_non_zero(self.type_id, incoming.type_id);
        self.name = text(self.name.take(), incoming.name.as_deref());
        self.vendor_name = text(self.vendor_name.take(), incoming.vendor_name.as_deref());
        self.model = text(self.model.take(), incoming.model.as_deref());
        self.hostname = text(self.hostname.take(), incoming.hostname.as_deref());
        self.ip = text(self.ip.take(), incoming.ip.as_deref());
        self.mac = text(self.mac.take(), incoming.mac.as_deref());
        self.domain = text(self.domain.take(), incoming.domain.as_deref());
        self.risk_level = text(self.risk_level.take(), incoming.risk_level.as_deref());
        self.risk_score = incoming.risk_score.or(self.risk_score);
        self.is_managed = incoming.is_managed.or(self.is_managed);
        self.is_available = incoming.is_available;

        for (stored, new) in [
            (&mut self.os, &incoming.os),
            (&mut self.hw_info, &incoming.hw_info),
            (&mut self.owner, &incoming.owner),
            (&mut self.org, &incoming.org),
        ] {
            *stored = merge::shallow_merge(stored.as_ref(), new.as_ref());
        }

        let ifaces = merge::union_values(
            Some(&Value::Array(std::mem::take(&mut self.network_interfaces))),
            Some(&Value::Array(incoming.network_interfaces.clone())),
        );
        self.network_interfaces = match ifaces {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        union_strings(&mut self.discovery_sources, &incoming.discovery_sources);
        union_strings(&mut self.capabilities, &incoming.capabilities);

        for (k, v) in &incoming.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }

        self.first_seen = match (self.first_seen, incoming.first_seen) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_seen = incoming.last_seen.or(self.last_seen);
    }
}

fn union_strings(stored: &mut Vec<String>, incoming: &[String]) {
    for item in incoming {
        if !stored.contains(item) {
            stored.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored() -> DeviceRecord {
        DeviceRecord {
            type_id: 4,
            hostname: Some("host-1".into()),
            ip: Some("10.0.0.5".into()),
            os: Some(json!({"name": "linux", "version": "6.1"})),
            discovery_sources: vec!["armis".into()],
            metadata: json!({"site": "hq"}).as_object().cloned().unwrap(),
            first_seen: Some(1_000),
            last_seen: Some(2_000),
            ..DeviceRecord::new("sr:1")
        }
    }

    #[test]
    fn blank_uid_is_rejected() {
        assert!(DeviceRecord::new("  ").validate().is_err());
        assert!(DeviceRecord::new("sr:1").validate().is_ok());
    }

    #[test]
    fn nested_objects_must_be_objects() {
        let mut device = DeviceRecord::new("sr:1");
        device.os = Some(json!(["linux"]));
        assert!(device.validate().is_err());
    }

    #[test]
    fn narrow_report_does_not_erase_known_facts() {
        let mut device = stored();
        let incoming = DeviceRecord {
            hostname: Some(String::new()),
            discovery_sources: vec!["sweep".into()],
            last_seen: Some(3_000),
            first_seen: Some(2_500),
            is_available: true,
            ..DeviceRecord::new("sr:1")
        };
        device.merge(&incoming);

        assert_eq!(device.hostname.as_deref(), Some("host-1"));
        assert_eq!(device.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(device.type_id, 4);
        assert_eq!(device.discovery_sources, vec!["armis", "sweep"]);
        assert_eq!(device.os, Some(json!({"name": "linux", "version": "6.1"})));
        assert_eq!(device.first_seen, Some(1_000));
        assert_eq!(device.last_seen, Some(3_000));
        assert!(device.is_available);
    }

    #[test]
    fn nested_object_merges_shallowly() {
        let mut device = stored();
        let incoming = DeviceRecord {
            os: Some(json!({"version": "6.8", "arch": "arm64"})),
            type_id: 9,
            ..DeviceRecord::new("sr:1")
        };
        device.merge(&incoming);
        assert_eq!(device.os, Some(json!({"name": "linux", "version": "6.8", "arch": "arm64"})));
        assert_eq!(device.type_id, 9);
    }

    #[test]
    fn every_rule_column_is_unique() {
        let mut cols: Vec<_> = DEVICE_MERGE_RULES.iter().map(|r| r.column).collect();
        cols.sort_unstable();
        cols.dedup();
        assert_eq!(cols.len(), DEVICE_MERGE_RULES.len());
    }
}
