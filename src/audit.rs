//! Append-only conflict audit trail.

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::conflict::Resolution;
use crate::db::DbState;
use crate::error::Result;
use crate::model::{
    fmt_ts, parse_json, parse_ts, text_column, ConflictRecord, EntityKey, MutationRecord,
};
use crate::remote::RemoteChange;

const CONFLICT_COLUMNS: &str = "id, mutation_id, entity_type, entity_id, local_operation,
     local_version, local_base_version, local_payload, remote_operation, remote_version,
     remote_base_version, remote_payload, resolution, resolved_payload, created_at";

/// Build the audit entry for a resolved conflict.
pub fn conflict_record(
    local: &MutationRecord,
    remote: &RemoteChange,
    resolution: &Resolution,
) -> ConflictRecord {
    ConflictRecord {
        id: Uuid::new_v4().to_string(),
        mutation_id: local.id,
        key: local.key.clone(),
        local_operation: local.operation,
        local_version: local.local_version,
        local_base_version: local.base_version,
        local_payload: local.payload.clone(),
        remote_operation: remote.operation,
        remote_version: remote.version,
        remote_base_version: remote.base_version,
        remote_payload: remote.state().cloned(),
        resolution: resolution.kind.as_str().to_string(),
        resolved_payload: resolution.state.clone(),
        created_at: Utc::now(),
    }
}

pub(crate) fn insert(conn: &Connection, record: &ConflictRecord) -> Result<()> {
    let json = |v: &Option<Value>| v.as_ref().map(serde_json::to_string).transpose();
    conn.execute(
        &format!(
            "INSERT INTO conflict_records ({CONFLICT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            record.id,
            record.mutation_id,
            record.key.entity_type,
            record.key.entity_id,
            record.local_operation.as_str(),
            record.local_version,
            record.local_base_version,
            json(&record.local_payload)?,
            record.remote_operation.as_str(),
            record.remote_version,
            record.remote_base_version,
            json(&record.remote_payload)?,
            record.resolution,
            json(&record.resolved_payload)?,
            fmt_ts(record.created_at),
        ],
    )?;
    info!(
        entity = %record.key,
        mutation_id = record.mutation_id,
        resolution = %record.resolution,
        remote_version = record.remote_version,
        "Recorded sync conflict"
    );
    Ok(())
}

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    Ok(ConflictRecord {
        id: row.get(0)?,
        mutation_id: row.get(1)?,
        key: EntityKey::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
        local_operation: text_column(row, 4)?,
        local_version: row.get(5)?,
        local_base_version: row.get(6)?,
        local_payload: parse_json(row.get(7)?),
        remote_operation: text_column(row, 8)?,
        remote_version: row.get(9)?,
        remote_base_version: row.get(10)?,
        remote_payload: parse_json(row.get(11)?),
        resolution: row.get(12)?,
        resolved_payload: parse_json(row.get(13)?),
        created_at: parse_ts(row.get(14)?).unwrap_or_else(Utc::now),
    })
}

/// Most recent conflicts first, optionally for a single entity.
pub fn list(db: &DbState, key: Option<&EntityKey>, limit: usize) -> Result<Vec<ConflictRecord>> {
    db.read(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflict_records
             WHERE (?1 IS NULL OR (entity_type = ?1 AND entity_id = ?2))
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![
                key.map(|k| k.entity_type.as_str()),
                key.map(|k| k.entity_id.as_str()),
                limit as i64
            ],
            row_to_conflict,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
}

pub fn count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM conflict_records", [], |row| row.get(0))?)
}
