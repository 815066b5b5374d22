//! Read-only sync status snapshot for operators and the UI.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::audit;
use crate::checkpoint;
use crate::db::DbState;
use crate::deferred;
use crate::error::Result;
use crate::model::parse_ts;
use crate::outbox;
use crate::scheduler::SchedulerState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub sync_enabled: bool,
    /// Last cached probe answer; `None` when unknown or expired.
    pub reachable: Option<bool>,
    pub scheduler: SchedulerState,
    /// Records not yet acknowledged (pending + in flight).
    pub pending: i64,
    pub in_flight: i64,
    pub retrying: i64,
    pub failed: i64,
    pub conflicted: i64,
    pub settled: i64,
    pub deferred_remote_changes: i64,
    pub conflict_records: i64,
    pub pending_by_entity_type: BTreeMap<String, i64>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Build a snapshot in one read of the database.
pub fn snapshot(
    db: &DbState,
    sync_enabled: bool,
    reachable: Option<bool>,
    scheduler: SchedulerState,
) -> Result<SyncStatus> {
    db.read(|conn| {
        let counts = outbox::counts(conn)?;
        let cp = checkpoint::load(conn)?;
        let last_error = match cp.last_error.clone() {
            Some(e) => Some(e),
            None => latest_record_error(conn)?,
        };

        Ok(SyncStatus {
            sync_enabled,
            reachable,
            scheduler,
            pending: counts.unsent(),
            in_flight: counts.in_flight,
            retrying: counts.retrying,
            failed: counts.failed,
            conflicted: counts.conflicted,
            settled: counts.settled,
            deferred_remote_changes: deferred::count(conn)?,
            conflict_records: audit::count(conn)?,
            pending_by_entity_type: outbox::pending_by_entity_type(conn)?,
            next_retry_at: next_retry_at(conn)?,
            last_successful_sync_at: cp.last_full_sync_at,
            consecutive_failures: cp.consecutive_failures,
            last_error,
        })
    })
}

fn next_retry_at(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn.query_row(
        "SELECT MIN(next_retry_at) FROM mutation_log
         WHERE status = 'pending' AND next_retry_at IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(parse_ts(raw))
}

/// Error of the most recently attempted record that is failed or waiting
/// for a retry.
fn latest_record_error(conn: &Connection) -> Result<Option<String>> {
    let raw: Option<String> = conn.query_row(
        "SELECT last_error FROM mutation_log
         WHERE last_error IS NOT NULL AND status IN ('pending', 'failed')
         ORDER BY last_attempt_at DESC, id DESC
         LIMIT 1",
        [],
        |row| row.get(0),
    ).or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    })?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::db;
    use crate::error::SyncError;
    use crate::model::{EntityKey, NewMutation, SyncCheckpoint};
    use serde_json::json;

    #[test]
    fn test_snapshot_reflects_outbox_and_checkpoint() {
        let db = db::open_in_memory().unwrap();
        let a = outbox::capture(&db, &NewMutation::create(EntityKey::new("product", "P1"), json!({ "qty": 1 }))).unwrap();
        outbox::capture(&db, &NewMutation::create(EntityKey::new("sale", "S1"), json!({ "total": 3 }))).unwrap();

        let now = Utc::now();
        outbox::next_batch(&db, 1, now).unwrap();
        outbox::mark_failed(
            &db,
            a.id,
            &SyncError::Transport("Sync server error (HTTP 503)".into()),
            &BackoffPolicy::default(),
            now,
        )
        .unwrap();

        let status = snapshot(&db, true, Some(true), SchedulerState::Idle).unwrap();
        assert_eq!(status.pending, 2);
        assert_eq!(status.retrying, 1);
        assert_eq!(status.failed, 0);
        assert_eq!(status.pending_by_entity_type.get("sale"), Some(&1));
        assert!(status.next_retry_at.is_some());
        assert!(status.last_error.unwrap().contains("HTTP 503"));
        assert!(status.last_successful_sync_at.is_none());

        checkpoint::save(
            &db,
            &SyncCheckpoint {
                last_full_sync_at: Some(now),
                consecutive_failures: 2,
                last_error: Some("transport error: timed out".into()),
                ..SyncCheckpoint::default()
            },
        )
        .unwrap();
        let status = snapshot(&db, true, None, SchedulerState::Running).unwrap();
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_error.as_deref(), Some("transport error: timed out"));
        assert!(status.last_successful_sync_at.is_some());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let db = db::open_in_memory().unwrap();
        let status = snapshot(&db, false, None, SchedulerState::Stopped).unwrap();
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["syncEnabled"], json!(false));
        assert_eq!(value["pending"], json!(0));
        assert_eq!(value["scheduler"]["state"], json!("stopped"));
        assert!(value["lastError"].is_null());
    }
}
