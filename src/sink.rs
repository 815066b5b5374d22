//! Where remote state lands locally.
//!
//! The worker hands every remote change it accepts, and every conflict
//! outcome that changes the local view, to an `EntitySink`. The call runs
//! inside the same transaction that advances the entity's version cursor.
//! Applications with their own tables implement the trait; the default sink
//! keeps the latest state of each entity in `synced_entities`.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Result;
use crate::model::{fmt_ts, parse_json, EntityKey};

pub trait EntitySink: Send + Sync {
    /// Store `state` (`None` = deleted) as the local view of `key` at
    /// `remote_version`.
    fn apply(
        &self,
        conn: &Connection,
        key: &EntityKey,
        state: Option<&Value>,
        remote_version: i64,
    ) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncedEntityTable;

impl EntitySink for SyncedEntityTable {
    fn apply(
        &self,
        conn: &Connection,
        key: &EntityKey,
        state: Option<&Value>,
        remote_version: i64,
    ) -> Result<()> {
        let payload = state.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO synced_entities (
                 entity_type, entity_id, payload, deleted, remote_version, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                payload = excluded.payload,
                deleted = excluded.deleted,
                remote_version = excluded.remote_version,
                updated_at = excluded.updated_at",
            params![
                key.entity_type,
                key.entity_id,
                payload,
                state.is_none() as i64,
                remote_version,
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }
}

/// Local view of one entity as written by `SyncedEntityTable`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedEntity {
    pub state: Option<Value>,
    pub deleted: bool,
    pub remote_version: i64,
}

pub fn synced_entity(conn: &Connection, key: &EntityKey) -> Result<Option<SyncedEntity>> {
    Ok(conn
        .query_row(
            "SELECT payload, deleted, remote_version FROM synced_entities
             WHERE entity_type = ?1 AND entity_id = ?2",
            params![key.entity_type, key.entity_id],
            |row| {
                Ok(SyncedEntity {
                    state: parse_json(row.get(0)?),
                    deleted: row.get::<_, i64>(1)? != 0,
                    remote_version: row.get(2)?,
                })
            },
        )
        .optional()?)
}
