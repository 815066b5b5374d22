//! Persisted process-wide sync progress (single row, id = 1).

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::DbState;
use crate::error::Result;
use crate::model::{fmt_ts, parse_ts, SyncCheckpoint};

pub fn load(conn: &Connection) -> Result<SyncCheckpoint> {
    let row = conn
        .query_row(
            "SELECT last_full_sync_at, last_seen_cursor, consecutive_failures, last_error
             FROM sync_checkpoint WHERE id = 1",
            [],
            |row| {
                Ok(SyncCheckpoint {
                    last_full_sync_at: parse_ts(row.get(0)?),
                    last_seen_cursor: row.get(1)?,
                    consecutive_failures: row.get::<_, i64>(2)?.max(0) as u32,
                    last_error: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row.unwrap_or_default())
}

pub fn save(db: &DbState, checkpoint: &SyncCheckpoint) -> Result<()> {
    db.with_transaction(|tx| {
        tx.execute(
            "INSERT INTO sync_checkpoint (
                 id, last_full_sync_at, last_seen_cursor, consecutive_failures, last_error,
                 updated_at
             ) VALUES (1, ?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                last_full_sync_at = excluded.last_full_sync_at,
                last_seen_cursor = excluded.last_seen_cursor,
                consecutive_failures = excluded.consecutive_failures,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![
                checkpoint.last_full_sync_at.map(fmt_ts),
                checkpoint.last_seen_cursor,
                checkpoint.consecutive_failures,
                checkpoint.last_error,
            ],
        )?;
        Ok(())
    })
}
