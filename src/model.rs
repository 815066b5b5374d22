//! Core records shared by the outbox, the worker and the resolver.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" | "insert" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(SyncError::Validation(format!("unknown operation {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Settled,
    Failed,
    Conflicted,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "in_flight",
            MutationStatus::Settled => "settled",
            MutationStatus::Failed => "failed",
            MutationStatus::Conflicted => "conflicted",
        }
    }

    /// No automatic transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MutationStatus::Settled | MutationStatus::Failed | MutationStatus::Conflicted
        )
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "in_flight" => Ok(MutationStatus::InFlight),
            "settled" => Ok(MutationStatus::Settled),
            "failed" => Ok(MutationStatus::Failed),
            "conflicted" => Ok(MutationStatus::Conflicted),
            other => Err(SyncError::Validation(format!("unknown status {other:?}"))),
        }
    }
}

/// `(entity_type, entity_id)` pair identifying one domain row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A local change as handed over by the business layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub key: EntityKey,
    pub operation: Operation,
    /// Full post-mutation state; ignored for deletes.
    pub payload: Option<Value>,
}

impl NewMutation {
    pub fn create(key: EntityKey, payload: Value) -> Self {
        Self {
            key,
            operation: Operation::Create,
            payload: Some(payload),
        }
    }

    pub fn update(key: EntityKey, payload: Value) -> Self {
        Self {
            key,
            operation: Operation::Update,
            payload: Some(payload),
        }
    }

    pub fn delete(key: EntityKey) -> Self {
        Self {
            key,
            operation: Operation::Delete,
            payload: None,
        }
    }
}

/// One captured local change as stored in the mutation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub id: i64,
    pub key: EntityKey,
    pub operation: Operation,
    pub payload: Option<Value>,
    pub local_version: i64,
    /// Remote version the change was made against.
    pub base_version: i64,
    pub created_at: DateTime<Utc>,
    pub status: MutationStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Earlier records for the same entity folded into this one by
    /// `next_batch`; they share this record's outcome.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub folded_ids: Vec<i64>,
}

/// Per-entity high-water mark of the last remote version merged locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVersionCursor {
    pub key: EntityKey,
    pub local_version: i64,
    pub remote_version: i64,
    /// Remote state at `remote_version`; the common ancestor for merges.
    pub snapshot: Option<Value>,
    pub deleted: bool,
}

/// Process-wide sync progress, persisted as a single row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_seen_cursor: Option<String>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Immutable audit entry written when local and remote both touched an entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub mutation_id: i64,
    pub key: EntityKey,
    pub local_operation: Operation,
    pub local_version: i64,
    pub local_base_version: i64,
    pub local_payload: Option<Value>,
    pub remote_operation: Operation,
    pub remote_version: i64,
    pub remote_base_version: i64,
    pub remote_payload: Option<Value>,
    pub resolution: String,
    pub resolved_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Fixed-width UTC timestamps so stored values compare lexically.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_json(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .filter(|v| !v.is_null())
}

/// Read a text column holding one of our enums. An unknown value is a
/// conversion error, not a default.
pub(crate) fn text_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = SyncError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: SyncError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_round_trip_and_legacy_alias() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert_eq!("insert".parse::<Operation>().unwrap(), Operation::Create);
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!MutationStatus::Pending.is_terminal());
        assert!(!MutationStatus::InFlight.is_terminal());
        assert!(MutationStatus::Settled.is_terminal());
        assert!(MutationStatus::Failed.is_terminal());
        assert!(MutationStatus::Conflicted.is_terminal());
    }

    #[test]
    fn test_parse_helpers_ignore_garbage() {
        assert!(parse_ts(Some("not a date".into())).is_none());
        assert!(parse_json(Some("null".into())).is_none());
        assert_eq!(
            parse_json(Some(r#"{"qty":3}"#.into())),
            Some(serde_json::json!({ "qty": 3 }))
        );
    }
}
