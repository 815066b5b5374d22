//! Remote changes held back while the entity still has unsent local work.
//!
//! Only the newest deferred change per entity is kept: the remote state it
//! carries supersedes anything older.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::model::{fmt_ts, parse_json, text_column, EntityKey};
use crate::remote::RemoteChange;

pub(crate) fn store(conn: &Connection, change: &RemoteChange) -> Result<()> {
    let payload = change.state().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO deferred_changes (
             entity_type, entity_id, operation, version, base_version, payload, received_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            operation = excluded.operation,
            version = excluded.version,
            base_version = excluded.base_version,
            payload = excluded.payload,
            received_at = excluded.received_at
         WHERE excluded.version > deferred_changes.version",
        params![
            change.entity_type,
            change.entity_id,
            change.operation.as_str(),
            change.version,
            change.base_version,
            payload,
            fmt_ts(Utc::now()),
        ],
    )?;
    Ok(())
}

/// All deferred changes, oldest first.
pub(crate) fn all(conn: &Connection) -> Result<Vec<RemoteChange>> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, entity_id, operation, version, base_version, payload
         FROM deferred_changes ORDER BY received_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(RemoteChange {
            entity_type: row.get(0)?,
            entity_id: row.get(1)?,
            operation: text_column(row, 2)?,
            version: row.get(3)?,
            base_version: row.get(4)?,
            payload: parse_json(row.get(5)?),
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Drop the deferred change for `key` if it is not newer than `version`.
pub(crate) fn clear_through(conn: &Connection, key: &EntityKey, version: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM deferred_changes
         WHERE entity_type = ?1 AND entity_id = ?2 AND version <= ?3",
        params![key.entity_type, key.entity_id, version],
    )?;
    Ok(())
}

pub fn count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM deferred_changes", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::Operation;
    use serde_json::json;

    fn change(version: i64, qty: i64) -> RemoteChange {
        RemoteChange {
            entity_type: "product".into(),
            entity_id: "P1".into(),
            operation: Operation::Update,
            version,
            base_version: version - 1,
            payload: Some(json!({ "qty": qty })),
        }
    }

    #[test]
    fn test_keeps_only_newest_change_per_entity() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        store(&conn, &change(3, 3)).unwrap();
        store(&conn, &change(2, 2)).unwrap();
        store(&conn, &change(4, 4)).unwrap();

        let held = all(&conn).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].version, 4);
        assert_eq!(held[0].payload, Some(json!({ "qty": 4 })));

        let key = EntityKey::new("product", "P1");
        clear_through(&conn, &key, 3).unwrap();
        assert_eq!(count(&conn).unwrap(), 1);
        clear_through(&conn, &key, 4).unwrap();
        assert_eq!(count(&conn).unwrap(), 0);
    }
}
