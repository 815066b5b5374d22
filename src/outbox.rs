//! Mutation log (outbox).
//!
//! Every local write that must reach the remote store is appended here in the
//! same SQLite transaction as the business write. The sync worker drains it
//! with `next_batch` and reports each outcome back through the `mark_*`
//! functions. Those transitions are idempotent: a record that already reached
//! a terminal state is left alone.
//!
//! While a coalesced batch entry is in flight, the earlier records folded into
//! it carry `coalesced_into = <representative id>` and follow the
//! representative's outcome.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::config::BackoffPolicy;
use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::model::{
    fmt_ts, parse_json, parse_ts, text_column, EntityKey, MutationRecord, MutationStatus,
    NewMutation, Operation,
};

const RECORD_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, local_version,
     base_version, created_at, status, attempt_count, last_attempt_at, last_error,
     next_retry_at";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MutationRecord> {
    let attempt_count: i64 = row.get(9)?;
    Ok(MutationRecord {
        id: row.get(0)?,
        key: EntityKey::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        operation: text_column(row, 3)?,
        payload: parse_json(row.get(4)?),
        local_version: row.get(5)?,
        base_version: row.get(6)?,
        created_at: parse_ts(row.get(7)?).unwrap_or_else(Utc::now),
        status: text_column(row, 8)?,
        attempt_count: attempt_count.max(0) as u32,
        last_attempt_at: parse_ts(row.get(10)?),
        last_error: row.get(11)?,
        next_retry_at: parse_ts(row.get(12)?),
        folded_ids: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Append a mutation inside the caller's transaction.
///
/// Bumps the entity's local version and records the remote version the
/// change was made against. Never touches the network.
pub fn append(
    conn: &Connection,
    mutation: &NewMutation,
    now: DateTime<Utc>,
) -> Result<MutationRecord> {
    validate(mutation)?;

    let (local_version, base_version): (i64, i64) = conn.query_row(
        "INSERT INTO entity_versions (entity_type, entity_id, local_version, updated_at)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            local_version = local_version + 1,
            updated_at = excluded.updated_at
         RETURNING local_version, remote_version",
        params![mutation.key.entity_type, mutation.key.entity_id, fmt_ts(now)],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let payload = match mutation.operation {
        Operation::Delete => None,
        _ => mutation.payload.clone(),
    };
    let payload_text = payload.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO mutation_log (
             entity_type, entity_id, operation, payload, local_version, base_version,
             created_at, status
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
        params![
            mutation.key.entity_type,
            mutation.key.entity_id,
            mutation.operation.as_str(),
            payload_text,
            local_version,
            base_version,
            fmt_ts(now),
        ],
    )?;
    let id = conn.last_insert_rowid();

    debug!(
        id,
        entity = %mutation.key,
        operation = %mutation.operation,
        local_version,
        "Captured local mutation"
    );

    Ok(MutationRecord {
        id,
        key: mutation.key.clone(),
        operation: mutation.operation,
        payload,
        local_version,
        base_version,
        created_at: now,
        status: MutationStatus::Pending,
        attempt_count: 0,
        last_attempt_at: None,
        last_error: None,
        next_retry_at: None,
        folded_ids: Vec::new(),
    })
}

/// Append a mutation in its own transaction. Callers that also perform a
/// business write should use `DbState::with_transaction` + `append` instead.
pub fn capture(db: &DbState, mutation: &NewMutation) -> Result<MutationRecord> {
    db.with_transaction(|tx| append(tx, mutation, Utc::now()))
}

fn validate(mutation: &NewMutation) -> Result<()> {
    if mutation.key.entity_type.trim().is_empty() || mutation.key.entity_id.trim().is_empty() {
        return Err(SyncError::Validation(
            "entity type and id must not be empty".into(),
        ));
    }
    if mutation.operation != Operation::Delete {
        match &mutation.payload {
            Some(serde_json::Value::Object(_)) => {}
            Some(_) => {
                return Err(SyncError::Validation(format!(
                    "{} payload for {} must be a JSON object",
                    mutation.operation, mutation.key
                )))
            }
            None => {
                return Err(SyncError::Validation(format!(
                    "{} for {} is missing its payload",
                    mutation.operation, mutation.key
                )))
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// Effective operation of a run of pending records for one entity, oldest
/// first. A trailing delete always wins; a create that is not undone by a
/// later delete keeps the entity a create, since the remote never saw it.
pub fn coalesce_operations(ops: &[Operation]) -> Option<Operation> {
    let last = *ops.last()?;
    if last != Operation::Update {
        return Some(last);
    }
    let last_delete = ops.iter().rposition(|op| *op == Operation::Delete);
    let last_create = ops.iter().rposition(|op| *op == Operation::Create);
    match (last_create, last_delete) {
        (Some(c), Some(d)) if c > d => Some(Operation::Create),
        (Some(_), None) => Some(Operation::Create),
        _ => Some(Operation::Update),
    }
}

/// Take up to `max_size` entities with eligible pending records, ordered by
/// their oldest record id, and mark them in flight.
///
/// Each returned record is the latest pending record of its entity, carrying
/// the coalesced operation, the base version of the oldest folded record and
/// the highest attempt count of the group. Entities that already have a
/// record in flight are skipped.
pub fn next_batch(
    db: &DbState,
    max_size: usize,
    now: DateTime<Utc>,
) -> Result<Vec<MutationRecord>> {
    if max_size == 0 {
        return Ok(Vec::new());
    }
    let now_text = fmt_ts(now);

    db.with_transaction(|tx| {
        let entities: Vec<EntityKey> = {
            let mut stmt = tx.prepare(
                "SELECT m.entity_type, m.entity_id, MIN(m.id) AS first_id
                 FROM mutation_log m
                 WHERE m.status = 'pending'
                   AND NOT EXISTS (
                        SELECT 1 FROM mutation_log f
                        WHERE f.entity_type = m.entity_type
                          AND f.entity_id = m.entity_id
                          AND f.status = 'in_flight'
                   )
                 GROUP BY m.entity_type, m.entity_id
                 HAVING MAX(COALESCE(m.next_retry_at, '')) <= ?1
                 ORDER BY first_id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now_text, max_size as i64], |row| {
                Ok(EntityKey::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut batch = Vec::with_capacity(entities.len());
        for key in entities {
            let group: Vec<MutationRecord> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM mutation_log
                     WHERE entity_type = ?1 AND entity_id = ?2 AND status = 'pending'
                     ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(params![key.entity_type, key.entity_id], row_to_record)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            let ops: Vec<Operation> = group.iter().map(|r| r.operation).collect();
            let (Some(operation), Some(first), Some(last)) =
                (coalesce_operations(&ops), group.first(), group.last())
            else {
                continue;
            };

            let mut record = last.clone();
            record.operation = operation;
            record.base_version = first.base_version;
            record.attempt_count = group.iter().map(|r| r.attempt_count).max().unwrap_or(0);
            record.status = MutationStatus::InFlight;
            record.last_attempt_at = Some(now);
            record.folded_ids = group[..group.len() - 1].iter().map(|r| r.id).collect();

            tx.execute(
                "UPDATE mutation_log
                 SET status = 'in_flight', last_attempt_at = ?1, attempt_count = ?2,
                     coalesced_into = NULL
                 WHERE id = ?3",
                params![now_text, record.attempt_count, record.id],
            )?;
            for folded in &record.folded_ids {
                tx.execute(
                    "UPDATE mutation_log
                     SET status = 'in_flight', coalesced_into = ?1
                     WHERE id = ?2",
                    params![record.id, folded],
                )?;
            }

            if !record.folded_ids.is_empty() {
                debug!(
                    id = record.id,
                    entity = %record.key,
                    folded = record.folded_ids.len(),
                    operation = %record.operation,
                    "Coalesced pending mutations"
                );
            }
            batch.push(record);
        }

        Ok(batch)
    })
}

// ---------------------------------------------------------------------------
// Outcome transitions
// ---------------------------------------------------------------------------

/// Result of reporting a transmission failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Still pending; eligible again at `next_retry_at`.
    Retry {
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Terminal `Failed`; needs an operator.
    Terminal { attempt_count: u32, error: String },
    /// The record had already reached a terminal state.
    Ignored,
}

fn load_status(conn: &Connection, id: i64) -> Result<Option<(MutationStatus, u32)>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT status, attempt_count FROM mutation_log WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((status, attempts)) => Ok(Some((status.parse()?, attempts.max(0) as u32))),
        None => Ok(None),
    }
}

/// Apply a terminal transition to a representative record and the records
/// folded into it. Returns `false` when the record was already terminal.
pub(crate) fn finish(
    conn: &Connection,
    id: i64,
    status: MutationStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some((current, attempts)) = load_status(conn, id)? else {
        return Err(SyncError::NotFound(format!("mutation {id}")));
    };
    if current.is_terminal() {
        return Ok(false);
    }

    let now_text = fmt_ts(now);
    let settled_at = (status == MutationStatus::Settled).then(|| now_text.clone());
    let attempt_count = attempts + 1;
    conn.execute(
        "UPDATE mutation_log
         SET status = ?1, attempt_count = ?2, last_error = ?3, next_retry_at = NULL,
             settled_at = ?4, coalesced_into = NULL
         WHERE id = ?5",
        params![status.as_str(), attempt_count, error, settled_at, id],
    )?;
    conn.execute(
        "UPDATE mutation_log
         SET status = ?1, attempt_count = ?2, last_error = ?3, next_retry_at = NULL,
             settled_at = ?4
         WHERE coalesced_into = ?5 AND status = 'in_flight'",
        params![status.as_str(), attempt_count, error, settled_at, id],
    )?;
    Ok(true)
}

/// Mark a record (and anything folded into it) settled after the remote
/// acknowledged it. No-op on a record that is already terminal.
pub fn mark_settled(db: &DbState, id: i64, now: DateTime<Utc>) -> Result<bool> {
    db.with_transaction(|tx| finish(tx, id, MutationStatus::Settled, None, now))
}

/// Mark a record conflicted: the remote won and the record is excluded from
/// automatic retry.
pub fn mark_conflicted(db: &DbState, id: i64, now: DateTime<Utc>) -> Result<bool> {
    db.with_transaction(|tx| {
        finish(
            tx,
            id,
            MutationStatus::Conflicted,
            Some("remote version won conflict resolution"),
            now,
        )
    })
}

/// Count a failed attempt.
///
/// Retryable errors put the record back to pending with a backoff delay
/// until the attempt ceiling is reached; anything else, or an exhausted
/// budget, is terminal.
pub fn mark_failed(
    db: &DbState,
    id: i64,
    error: &SyncError,
    policy: &BackoffPolicy,
    now: DateTime<Utc>,
) -> Result<FailureOutcome> {
    db.with_transaction(|tx| {
        let Some((current, attempts)) = load_status(tx, id)? else {
            return Err(SyncError::NotFound(format!("mutation {id}")));
        };
        if current.is_terminal() {
            return Ok(FailureOutcome::Ignored);
        }

        let attempt_count = attempts + 1;
        let message = error.to_string();

        if error.is_retryable() && attempt_count < policy.max_attempts {
            let next_retry_at = backoff::next_retry_at(now, attempt_count, policy, id);
            let retry_text = fmt_ts(next_retry_at);
            tx.execute(
                "UPDATE mutation_log
                 SET status = 'pending', attempt_count = ?1, last_error = ?2,
                     next_retry_at = ?3, coalesced_into = NULL
                 WHERE id = ?4",
                params![attempt_count, message, retry_text, id],
            )?;
            tx.execute(
                "UPDATE mutation_log
                 SET status = 'pending', attempt_count = ?1, last_error = ?2,
                     next_retry_at = ?3, coalesced_into = NULL
                 WHERE coalesced_into = ?4 AND status = 'in_flight'",
                params![attempt_count, message, retry_text, id],
            )?;
            return Ok(FailureOutcome::Retry {
                attempt_count,
                next_retry_at,
            });
        }

        let terminal_error = if error.is_retryable() {
            SyncError::ExhaustedRetries {
                attempts: attempt_count,
                last_error: message,
            }
            .to_string()
        } else {
            message
        };
        finish(tx, id, MutationStatus::Failed, Some(&terminal_error), now)?;
        Ok(FailureOutcome::Terminal {
            attempt_count,
            error: terminal_error,
        })
    })
}

/// Return in-flight records that were never transmitted to pending without
/// counting an attempt.
pub fn release(db: &DbState, ids: &[i64]) -> Result<usize> {
    db.with_transaction(|tx| {
        let mut released = 0;
        for id in ids {
            released += tx.execute(
                "UPDATE mutation_log SET status = 'pending', coalesced_into = NULL
                 WHERE (id = ?1 OR coalesced_into = ?1) AND status = 'in_flight'",
                params![id],
            )?;
        }
        Ok(released)
    })
}

/// Move records left in flight by an interrupted process back to pending.
pub fn recover_in_flight(db: &DbState) -> Result<usize> {
    let recovered = db.with_transaction(|tx| {
        Ok(tx.execute(
            "UPDATE mutation_log SET status = 'pending', coalesced_into = NULL
             WHERE status = 'in_flight'",
            [],
        )?)
    })?;
    if recovered > 0 {
        warn!(recovered, "Recovered in-flight mutations from previous run");
    }
    Ok(recovered)
}

/// Operator action: give a terminally failed record a fresh attempt budget.
pub fn requeue_failed(db: &DbState, id: i64) -> Result<()> {
    let updated = db.with_transaction(|tx| {
        Ok(tx.execute(
            "UPDATE mutation_log
             SET status = 'pending', attempt_count = 0, last_error = NULL,
                 next_retry_at = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )?)
    })?;
    if updated == 0 {
        return Err(SyncError::NotFound(format!("failed mutation {id}")));
    }
    info!(id, "Requeued failed mutation");
    Ok(())
}

/// Delete settled records older than `older_than`.
pub fn prune_settled(db: &DbState, older_than: DateTime<Utc>) -> Result<usize> {
    db.with_transaction(|tx| {
        Ok(tx.execute(
            "DELETE FROM mutation_log WHERE status = 'settled' AND settled_at < ?1",
            params![fmt_ts(older_than)],
        )?)
    })
}

/// After our own push for `key` was accepted at `new_version`, later pending
/// records for that entity were made on top of the pushed state; move their
/// base forward so the next push does not conflict with ourselves.
pub(crate) fn rebase_pending(
    conn: &Connection,
    key: &EntityKey,
    old_version: i64,
    new_version: i64,
) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE mutation_log SET base_version = ?1
         WHERE entity_type = ?2 AND entity_id = ?3
           AND status = 'pending' AND base_version = ?4",
        params![new_version, key.entity_type, key.entity_id, old_version],
    )?)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxCounts {
    pub pending: i64,
    pub in_flight: i64,
    /// Pending records whose last attempt failed transiently.
    pub retrying: i64,
    pub settled: i64,
    pub failed: i64,
    pub conflicted: i64,
}

impl OutboxCounts {
    /// Work still owed to the remote store.
    pub fn unsent(&self) -> i64 {
        self.pending + self.in_flight
    }
}

pub fn counts(conn: &Connection) -> Result<OutboxCounts> {
    let mut out = OutboxCounts::default();
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*), SUM(CASE WHEN last_error IS NOT NULL THEN 1 ELSE 0 END)
         FROM mutation_log GROUP BY status",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    for row in rows {
        let (status, count, with_error) = row?;
        match status.as_str() {
            "pending" => {
                out.pending = count;
                out.retrying = with_error;
            }
            "in_flight" => out.in_flight = count,
            "settled" => out.settled = count,
            "failed" => out.failed = count,
            "conflicted" => out.conflicted = count,
            _ => {}
        }
    }
    Ok(out)
}

pub fn get(db: &DbState, id: i64) -> Result<Option<MutationRecord>> {
    db.read(|conn| {
        Ok(conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM mutation_log WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?)
    })
}

/// Most recent records first, optionally filtered by status.
pub fn list(
    db: &DbState,
    status: Option<MutationStatus>,
    limit: usize,
) -> Result<Vec<MutationRecord>> {
    db.read(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM mutation_log
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            row_to_record,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
}

/// Whether `key` still has pending or in-flight local changes.
pub(crate) fn has_unsent(conn: &Connection, key: &EntityKey) -> Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS (
             SELECT 1 FROM mutation_log
             WHERE entity_type = ?1 AND entity_id = ?2
               AND status IN ('pending', 'in_flight')
         )",
        params![key.entity_type, key.entity_id],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// Pending counts per entity type, for operator tooling.
pub fn pending_by_entity_type(conn: &Connection) -> Result<BTreeMap<String, i64>> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, COUNT(*) FROM mutation_log
         WHERE status IN ('pending', 'in_flight')
         GROUP BY entity_type",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    Ok(rows.collect::<std::result::Result<BTreeMap<_, _>, _>>()?)
}

// ===========================================================================
// Tests
// ===========================================================================
