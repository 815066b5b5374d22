//! Per-entity version cursors.
//!
//! `entity_versions` holds two counters per entity: the local version bumped
//! by every captured mutation, and the remote version last merged locally
//! together with the remote state at that version. Only the sync worker moves
//! the remote side.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Result;
use crate::model::{fmt_ts, parse_json, EntityKey, EntityVersionCursor};

pub fn cursor(conn: &Connection, key: &EntityKey) -> Result<Option<EntityVersionCursor>> {
    let row = conn
        .query_row(
            "SELECT local_version, remote_version, remote_snapshot, remote_deleted
             FROM entity_versions WHERE entity_type = ?1 AND entity_id = ?2",
            params![key.entity_type, key.entity_id],
            |row| {
                Ok(EntityVersionCursor {
                    key: key.clone(),
                    local_version: row.get(0)?,
                    remote_version: row.get(1)?,
                    snapshot: parse_json(row.get(2)?),
                    deleted: row.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Remote version last merged for `key`, 0 when never synced.
pub fn remote_version(conn: &Connection, key: &EntityKey) -> Result<i64> {
    Ok(cursor(conn, key)?.map(|c| c.remote_version).unwrap_or(0))
}

/// Move the remote side of the cursor forward. Never moves backwards;
/// returns whether anything changed. `state == None` records a deletion.
pub(crate) fn advance(
    conn: &Connection,
    key: &EntityKey,
    remote_version: i64,
    state: Option<&Value>,
) -> Result<bool> {
    let snapshot = state.map(serde_json::to_string).transpose()?;
    let changed = conn.execute(
        "INSERT INTO entity_versions (
             entity_type, entity_id, local_version, remote_version, remote_snapshot,
             remote_deleted, updated_at
         ) VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6)
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            remote_version = excluded.remote_version,
            remote_snapshot = excluded.remote_snapshot,
            remote_deleted = excluded.remote_deleted,
            updated_at = excluded.updated_at
         WHERE excluded.remote_version > entity_versions.remote_version",
        params![
            key.entity_type,
            key.entity_id,
            remote_version,
            snapshot,
            state.is_none() as i64,
            fmt_ts(chrono::Utc::now()),
        ],
    )?;
    Ok(changed > 0)
}
