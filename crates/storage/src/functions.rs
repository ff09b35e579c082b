//! SQL scalar functions backing the JSON merge rules.
//!
//! Both functions delegate to [`fleetsync_core::merge::merge_json_text`], so
//! the upsert path and [`fleetsync_core::DeviceRecord::merge`] share one
//! implementation.

use rusqlite::Connection;
use rusqlite::functions::{Context, FunctionFlags};

use fleetsync_core::merge::{JSON_MERGE_FN, JSON_UNION_FN, MergeRule, merge_json_text};

use crate::error::StorageError;

/// Registers the merge functions on `conn`. Must run for every connection
/// that executes rendered upserts.
pub fn register(conn: &Connection) -> Result<(), StorageError> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function(JSON_UNION_FN, 2, flags, |ctx| merge(ctx, MergeRule::SetUnion))?;
    conn.create_scalar_function(JSON_MERGE_FN, 2, flags, |ctx| merge(ctx, MergeRule::ShallowMerge))?;
    Ok(())
}

fn merge(ctx: &Context<'_>, rule: MergeRule) -> rusqlite::Result<Option<String>> {
    let stored: Option<String> = ctx.get(0)?;
    let incoming: Option<String> = ctx.get(1)?;
    merge_json_text(rule, stored.as_deref(), incoming.as_deref())
        .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
}
