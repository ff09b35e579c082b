//! Field-level conflict resolution for upserts.
//!
//! Collectors report disjoint slices of a device at different times, so a
//! stored row is never blindly replaced. Each column carries a [`MergeRule`];
//! [`render_conflict_clause`] turns a rule table into the `ON CONFLICT ... DO
//! UPDATE SET` clause of an upsert, and the JSON rules call back into
//! [`union_values`] and [`shallow_merge`] through SQL functions registered
//! under [`JSON_UNION_FN`] and [`JSON_MERGE_FN`].

use serde_json::{Map, Value};

/// SQL function implementing [`MergeRule::SetUnion`].
pub const JSON_UNION_FN: &str = "fs_json_union";

/// SQL function implementing [`MergeRule::ShallowMerge`].
pub const JSON_MERGE_FN: &str = "fs_json_merge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Incoming wins unless NULL or the empty string.
    PreferNonEmpty,
    /// Incoming wins unless NULL or zero.
    PreferNonZero,
    /// Incoming wins unless NULL.
    PreferNonNull,
    /// Stored wins unless NULL.
    KeepExisting,
    /// Deduplicated union of two JSON arrays; never shrinks.
    SetUnion,
    /// Shallow JSON object merge, incoming keys override.
    ShallowMerge,
    /// Incoming always wins.
    Overwrite,
    /// Smaller of the two non-null values.
    Earliest,
    /// Larger of the two non-null values.
    Latest,
    /// Logical OR of two booleans, NULL counts as false.
    AnyTrue,
}

impl MergeRule {
    /// SQL expression resolving `column` of `table` against `excluded`.
    pub fn render(&self, table: &str, column: &str) -> String {
        let stored = format!("{table}.{column}");
        let incoming = format!("excluded.{column}");
        match self {
            Self::PreferNonEmpty => format!("COALESCE(NULLIF({incoming}, ''), {stored})"),
            Self::PreferNonZero => format!(
                "CASE WHEN {incoming} IS NOT NULL AND {incoming} <> 0 THEN {incoming} ELSE {stored} END"
            ),
            Self::PreferNonNull => format!("COALESCE({incoming}, {stored})"),
            Self::KeepExisting => format!("COALESCE({stored}, {incoming})"),
            Self::SetUnion => format!("{JSON_UNION_FN}({stored}, {incoming})"),
            Self::ShallowMerge => format!("{JSON_MERGE_FN}({stored}, {incoming})"),
            Self::Overwrite => incoming,
            // Multi-argument MIN/MAX yield NULL if any argument is NULL.
            Self::Earliest => format!("COALESCE(MIN({stored}, {incoming}), {stored}, {incoming})"),
            Self::Latest => format!("COALESCE(MAX({stored}, {incoming}), {stored}, {incoming})"),
            Self::AnyTrue => format!("(COALESCE({stored}, 0) OR COALESCE({incoming}, 0))"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRule {
    pub column: &'static str,
    pub rule: MergeRule,
}

pub const fn rule(column: &'static str, rule: MergeRule) -> ColumnRule {
    ColumnRule { column, rule }
}

/// Renders `ON CONFLICT <target> DO UPDATE SET ...` for `table`.
///
/// `target` is the conflict target as it appears in SQL, including any
/// partial-index predicate, e.g. `(partition, ip) WHERE status = 'active'`.
pub fn render_conflict_clause(table: &str, target: &str, rules: &[ColumnRule]) -> String {
    let assignments = rules
        .iter()
        .map(|r| format!("{} = {}", r.column, r.rule.render(table, r.column)))
        .collect::<Vec<_>>()
        .join(",\n    ");
    format!("ON CONFLICT {target} DO UPDATE SET\n    {assignments}")
}

/// Scalar text rule: incoming wins only when it carries a non-blank value.
pub fn prefer_non_empty(stored: Option<String>, incoming: Option<&str>) -> Option<String> {
    match incoming {
        Some(v) if !v.is_empty() => Some(v.to_string()),
        _ => stored,
    }
}

pub fn prefer_non_zero(stored: i32, incoming: i32) -> i32 {
    if incoming != 0 { incoming } else { stored }
}

/// Deduplicated union of two JSON arrays in first-seen order.
///
/// A non-array value is treated as a single element. Returns `None` only
/// when both sides are absent.
pub fn union_values(stored: Option<&Value>, incoming: Option<&Value>) -> Option<Value> {
    let stored = stored.filter(|v| !v.is_null());
    let incoming = incoming.filter(|v| !v.is_null());
    if stored.is_none() && incoming.is_none() {
        return None;
    }

    let mut out: Vec<Value> = Vec::new();
    for side in [stored, incoming].into_iter().flatten() {
        let items: &[Value] = match side {
            Value::Array(items) => items,
            single => std::slice::from_ref(single),
        };
        for item in items {
            if !item.is_null() && !out.contains(item) {
                out.push(item.clone());
            }
        }
    }
    Some(Value::Array(out))
}

/// Shallow merge of two JSON objects: incoming keys override stored keys,
/// keys absent from incoming are kept.
///
/// If either side is not an object the non-null incoming value wins.
pub fn shallow_merge(stored: Option<&Value>, incoming: Option<&Value>) -> Option<Value> {
    let stored = stored.filter(|v| !v.is_null());
    let incoming = incoming.filter(|v| !v.is_null());
    match (stored, incoming) {
        (None, None) => None,
        (Some(s), None) => Some(s.clone()),
        (None, Some(i)) => Some(i.clone()),
        (Some(Value::Object(s)), Some(Value::Object(i))) => {
            let mut merged: Map<String, Value> = s.clone();
            for (k, v) in i {
                merged.insert(k.clone(), v.clone());
            }
            Some(Value::Object(merged))
        }
        (Some(_), Some(i)) => Some(i.clone()),
    }
}

/// Merges serialized JSON text, as stored in the backend. Malformed stored
/// text is dropped in favour of the incoming side.
pub fn merge_json_text(
    rule: MergeRule,
    stored: Option<&str>,
    incoming: Option<&str>,
) -> Result<Option<String>, serde_json::Error> {
    let stored: Option<Value> = stored.and_then(|s| serde_json::from_str(s).ok());
    let incoming: Option<Value> = incoming.map(serde_json::from_str).transpose()?;
    let merged = match rule {
        MergeRule::SetUnion => union_values(stored.as_ref(), incoming.as_ref()),
        MergeRule::ShallowMerge => shallow_merge(stored.as_ref(), incoming.as_ref()),
        _ => incoming.or(stored),
    };
    merged.map(|v| serde_json::to_string(&v)).transpose()
}
