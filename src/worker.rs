//! Sync worker: one reconciliation cycle against the remote store.
//!
//! A cycle checks reachability, drains the outbox in batches (resolving
//! conflicts as they come back), then pulls the remote change feed. Every
//! local state transition for a record happens in one SQLite transaction
//! together with the version cursor and local entity state it implies.
//!
//! Only one cycle runs at a time; a second caller gets
//! `SyncError::CycleInProgress`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit;
use crate::clock::Clock;
use crate::config::{BackoffPolicy, SyncConfig};
use crate::conflict::{self, ConflictSide, MergeRegistry};
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::deferred;
use crate::error::{Result, SyncError};
use crate::model::{MutationRecord, MutationStatus, Operation, SyncCheckpoint};
use crate::outbox::{self, FailureOutcome};
use crate::remote::{PushAck, PushRequest, RemoteChange, RemoteStore};
use crate::sink::EntitySink;
use crate::versions;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub pull_page_size: usize,
    pub backoff: BackoffPolicy,
    pub request_timeout: Duration,
    /// Settled records older than this are pruned after a clean cycle.
    pub retention: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl WorkerSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            pull_page_size: config.batch_size.max(100),
            backoff: config.backoff,
            request_timeout: config.request_timeout,
            retention: config.retention,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    Offline,
    ShuttingDown,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Records acknowledged by the remote as sent.
    pub pushed: usize,
    /// Conflicts resolved by pushing a merged or replayed state.
    pub merged: usize,
    /// Records put back for a later retry.
    pub retrying: usize,
    /// Records that became terminally failed.
    pub failed: usize,
    /// Records that lost conflict resolution.
    pub conflicted: usize,
    /// Remote changes applied locally.
    pub pulled: usize,
    /// Remote changes held back behind unsent local work.
    pub deferred: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CycleReport {
    pub fn skipped(reason: SkipReason, at: DateTime<Utc>) -> Self {
        Self {
            skipped: Some(reason),
            started_at: Some(at),
            finished_at: Some(at),
            ..Self::default()
        }
    }

    pub fn failed(error: &SyncError, at: DateTime<Utc>) -> Self {
        Self {
            error: Some(error.to_string()),
            started_at: Some(at),
            finished_at: Some(at),
            ..Self::default()
        }
    }

    /// Ran to completion without a cycle-level error.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_none() && !self.cancelled && self.error.is_none()
    }
}

/// Per-record result of a push attempt.
#[derive(Debug, Clone, PartialEq)]
enum PushOutcome {
    Settled,
    Merged,
    Conflicted,
    /// Retry scheduled for a reason other than reachability.
    Retrying,
    Failed,
    /// The remote could not be reached; the rest of the batch waits.
    Unreachable { error: String, terminal: bool },
    AlreadyFinished,
}

/// Why a cycle stopped before finishing.
#[derive(Debug, Clone, PartialEq)]
enum CycleError {
    /// The remote failed or could not be reached.
    Remote(String),
    /// Recording an outcome in the local database failed.
    Local(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyOutcome {
    Applied,
    Deferred,
    Stale,
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncWorker {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<ConnectivityMonitor>,
    merges: MergeRegistry,
    sink: Arc<dyn EntitySink>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
    busy: AtomicBool,
}

impl SyncWorker {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteStore>,
        monitor: Arc<ConnectivityMonitor>,
        merges: MergeRegistry,
        sink: Arc<dyn EntitySink>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            db,
            remote,
            monitor,
            merges,
            sink,
            clock,
            settings,
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run one cycle starting from `checkpoint` and return the report with
    /// the checkpoint to persist. The cursor and `last_full_sync_at` only
    /// move when the whole cycle completed without a cycle-level error.
    pub async fn run_cycle(
        &self,
        checkpoint: SyncCheckpoint,
        cancel: &CancellationToken,
    ) -> Result<(CycleReport, SyncCheckpoint)> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::CycleInProgress);
        }
        let _guard = CycleGuard(&self.busy);

        let started = self.clock.now();
        if cancel.is_cancelled() {
            return Ok((CycleReport::skipped(SkipReason::ShuttingDown, started), checkpoint));
        }
        if !self.monitor.is_reachable().await {
            info!("Remote unreachable; deferring sync and keeping queue pending");
            return Ok((CycleReport::skipped(SkipReason::Offline, started), checkpoint));
        }

        let mut report = CycleReport {
            started_at: Some(started),
            ..CycleReport::default()
        };
        let mut checkpoint = checkpoint;

        // Only a cycle claims records, so anything still in flight was
        // stranded by an earlier cycle that stopped halfway.
        outbox::recover_in_flight(&self.db)?;
        let mut cycle_error = self.push_phase(&mut report, cancel).await?;

        let mut next_cursor = checkpoint.last_seen_cursor.clone();
        if cycle_error.is_none() && !report.cancelled {
            match self
                .pull_phase(checkpoint.last_seen_cursor.clone(), &mut report, cancel)
                .await
            {
                Ok(cursor) => next_cursor = cursor,
                Err(e @ (SyncError::Transport(_) | SyncError::Validation(_))) => {
                    cycle_error = Some(CycleError::Remote(e.to_string()))
                }
                Err(e) => return Err(e),
            }
        }

        let finished = self.clock.now();
        report.finished_at = Some(finished);

        if report.cancelled {
            info!(
                pushed = report.pushed,
                pulled = report.pulled,
                "Sync cycle interrupted by shutdown"
            );
        } else if let Some(err) = cycle_error {
            let err = match err {
                CycleError::Remote(msg) => {
                    self.monitor.invalidate();
                    msg
                }
                CycleError::Local(msg) => msg,
            };
            checkpoint.consecutive_failures = checkpoint.consecutive_failures.saturating_add(1);
            checkpoint.last_error = Some(err.clone());
            warn!(
                consecutive_failures = checkpoint.consecutive_failures,
                "Sync cycle failed: {err}"
            );
            report.error = Some(err);
        } else {
            checkpoint.last_full_sync_at = Some(finished);
            checkpoint.last_seen_cursor = next_cursor;
            checkpoint.consecutive_failures = 0;
            checkpoint.last_error = None;

            let cutoff = finished
                - ChronoDuration::from_std(self.settings.retention)
                    .unwrap_or_else(|_| ChronoDuration::days(30));
            let pruned = outbox::prune_settled(&self.db, cutoff)?;
            if pruned > 0 {
                debug!(pruned, "Pruned settled mutations");
            }

            if report.pushed + report.merged + report.pulled + report.conflicted + report.failed > 0 {
                info!(
                    pushed = report.pushed,
                    merged = report.merged,
                    conflicted = report.conflicted,
                    failed = report.failed,
                    pulled = report.pulled,
                    deferred = report.deferred,
                    "Sync cycle complete"
                );
            }
        }

        Ok((report, checkpoint))
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Drain due outbox records. Returns the error that stopped the phase
    /// early, if any.
    async fn push_phase(
        &self,
        report: &mut CycleReport,
        cancel: &CancellationToken,
    ) -> Result<Option<CycleError>> {
        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(None);
            }
            let batch = outbox::next_batch(&self.db, self.settings.batch_size, self.clock.now())?;
            if batch.is_empty() {
                return Ok(None);
            }
            debug!(size = batch.len(), "Pushing outbox batch");

            let mut records = batch.into_iter();
            while let Some(record) = records.next() {
                if cancel.is_cancelled() {
                    let unsent: Vec<i64> = std::iter::once(record.id)
                        .chain(records.by_ref().map(|r| r.id))
                        .collect();
                    let released = outbox::release(&self.db, &unsent)?;
                    debug!(released, "Released untransmitted records on shutdown");
                    report.cancelled = true;
                    return Ok(None);
                }

                let outcome = match self.push_record(&record).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // The outcome could not be recorded locally. Resending is
                        // idempotent, so the record goes back to pending as-is.
                        error!(id = record.id, entity = %record.key, "Failed to record push outcome: {e}");
                        let unsent: Vec<i64> = std::iter::once(record.id)
                            .chain(records.by_ref().map(|r| r.id))
                            .collect();
                        if let Err(release_err) = outbox::release(&self.db, &unsent) {
                            warn!("Failed to release unsent records: {release_err}");
                        }
                        return Ok(Some(CycleError::Local(e.to_string())));
                    }
                };
                match outcome {
                    PushOutcome::Settled => report.pushed += 1,
                    PushOutcome::Merged => report.merged += 1,
                    PushOutcome::Conflicted => report.conflicted += 1,
                    PushOutcome::Retrying => report.retrying += 1,
                    PushOutcome::Failed => report.failed += 1,
                    PushOutcome::AlreadyFinished => {}
                    PushOutcome::Unreachable { error, terminal } => {
                        if terminal {
                            report.failed += 1;
                        } else {
                            report.retrying += 1;
                        }
                        let unsent: Vec<i64> = records.by_ref().map(|r| r.id).collect();
                        outbox::release(&self.db, &unsent)?;
                        return Ok(Some(CycleError::Remote(error)));
                    }
                }
            }
        }
    }

    async fn send(&self, request: &PushRequest) -> Result<PushAck> {
        match tokio::time::timeout(self.settings.request_timeout, self.remote.push(request)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Transport(format!(
                "push timed out after {}s",
                self.settings.request_timeout.as_secs()
            ))),
        }
    }

    async fn push_record(&self, record: &MutationRecord) -> Result<PushOutcome> {
        let request = PushRequest::from_record(record);
        match self.send(&request).await {
            Ok(PushAck::Accepted { remote_version }) => {
                let now = self.clock.now();
                let state = request.payload.as_ref();
                let finished = self.db.with_transaction(|tx| {
                    versions::advance(tx, &record.key, remote_version, state)?;
                    self.sink.apply(tx, &record.key, state, remote_version)?;
                    outbox::rebase_pending(tx, &record.key, record.base_version, remote_version)?;
                    deferred::clear_through(tx, &record.key, remote_version)?;
                    outbox::finish(tx, record.id, MutationStatus::Settled, None, now)
                })?;
                debug!(
                    id = record.id,
                    entity = %record.key,
                    remote_version,
                    "Mutation accepted by remote"
                );
                Ok(if finished {
                    PushOutcome::Settled
                } else {
                    PushOutcome::AlreadyFinished
                })
            }
            Ok(PushAck::Conflict { remote }) => self.resolve_conflict(record, remote).await,
            Err(e) => self.record_failure(record, e),
        }
    }

    fn record_failure(&self, record: &MutationRecord, err: SyncError) -> Result<PushOutcome> {
        let outcome = outbox::mark_failed(
            &self.db,
            record.id,
            &err,
            &self.settings.backoff,
            self.clock.now(),
        )?;
        let transport = match &err {
            SyncError::Transport(msg) => Some(msg.clone()),
            _ => None,
        };

        Ok(match outcome {
            FailureOutcome::Retry {
                attempt_count,
                next_retry_at,
            } => {
                warn!(
                    id = record.id,
                    entity = %record.key,
                    attempt_count,
                    next_retry_at = %next_retry_at,
                    "Push failed, will retry: {err}"
                );
                match transport {
                    Some(error) => PushOutcome::Unreachable {
                        error,
                        terminal: false,
                    },
                    None => PushOutcome::Retrying,
                }
            }
            FailureOutcome::Terminal {
                attempt_count,
                error: message,
            } => {
                error!(
                    id = record.id,
                    entity = %record.key,
                    attempt_count,
                    "Push failed permanently: {message}"
                );
                match transport {
                    Some(error) => PushOutcome::Unreachable {
                        error,
                        terminal: true,
                    },
                    None => PushOutcome::Failed,
                }
            }
            FailureOutcome::Ignored => PushOutcome::AlreadyFinished,
        })
    }

    async fn resolve_conflict(
        &self,
        record: &MutationRecord,
        remote: RemoteChange,
    ) -> Result<PushOutcome> {
        let key = &record.key;
        let ancestor = self
            .db
            .read(|conn| versions::cursor(conn, key))?
            .filter(|c| c.remote_version == record.base_version && !c.deleted)
            .and_then(|c| c.snapshot);

        let local_side = ConflictSide {
            operation: record.operation,
            base_version: record.base_version,
            payload: record.payload.as_ref(),
        };
        let remote_side = ConflictSide {
            operation: remote.operation,
            base_version: remote.base_version,
            payload: remote.state(),
        };
        let resolution = conflict::resolve(
            &local_side,
            &remote_side,
            ancestor.as_ref(),
            self.merges.get(&key.entity_type),
        );
        debug!(
            id = record.id,
            entity = %key,
            remote_version = remote.version,
            resolution = %resolution.kind,
            "Push conflicted"
        );

        let audit_record = resolution
            .audit
            .then(|| audit::conflict_record(record, &remote, &resolution));

        if resolution.push {
            let operation = match (&resolution.state, remote.operation) {
                (None, _) => Operation::Delete,
                (Some(_), Operation::Delete) => Operation::Create,
                (Some(_), _) => Operation::Update,
            };
            let retry = PushRequest::new(
                key,
                operation,
                record.local_version,
                remote.version,
                resolution.state.clone(),
            );
            return match self.send(&retry).await {
                Ok(PushAck::Accepted { remote_version }) => {
                    let now = self.clock.now();
                    let state = resolution.state.as_ref();
                    self.db.with_transaction(|tx| {
                        if let Some(entry) = &audit_record {
                            audit::insert(tx, entry)?;
                        }
                        versions::advance(tx, key, remote_version, state)?;
                        self.sink.apply(tx, key, state, remote_version)?;
                        outbox::rebase_pending(tx, key, record.base_version, remote_version)?;
                        deferred::clear_through(tx, key, remote_version)?;
                        outbox::finish(tx, record.id, MutationStatus::Settled, None, now)
                    })?;
                    info!(
                        id = record.id,
                        entity = %key,
                        remote_version,
                        resolution = %resolution.kind,
                        "Conflict resolved and pushed"
                    );
                    Ok(PushOutcome::Merged)
                }
                Ok(PushAck::Conflict { remote: newer }) => self.record_failure(
                    record,
                    SyncError::Conflict {
                        entity_type: key.entity_type.clone(),
                        entity_id: key.entity_id.clone(),
                        remote_version: newer.version,
                    },
                ),
                Err(e) => self.record_failure(record, e),
            };
        }

        let now = self.clock.now();
        let rejected = resolution.local_rejected();
        let state = resolution.state.as_ref();
        let reason = format!("remote version {} won ({})", remote.version, resolution.kind);
        self.db.with_transaction(|tx| {
            if let Some(entry) = &audit_record {
                audit::insert(tx, entry)?;
            }
            versions::advance(tx, key, remote.version, state)?;
            self.sink.apply(tx, key, state, remote.version)?;
            deferred::clear_through(tx, key, remote.version)?;
            if rejected {
                outbox::finish(
                    tx,
                    record.id,
                    MutationStatus::Conflicted,
                    Some(reason.as_str()),
                    now,
                )
            } else {
                outbox::rebase_pending(tx, key, record.base_version, remote.version)?;
                outbox::finish(tx, record.id, MutationStatus::Settled, None, now)
            }
        })?;

        if rejected {
            warn!(
                id = record.id,
                entity = %key,
                remote_version = remote.version,
                resolution = %resolution.kind,
                "Local change lost conflict resolution"
            );
            Ok(PushOutcome::Conflicted)
        } else {
            Ok(PushOutcome::Settled)
        }
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    /// Re-evaluate held changes, then page through the change feed from
    /// `since`. Returns the cursor after the last page read.
    async fn pull_phase(
        &self,
        since: Option<String>,
        report: &mut CycleReport,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let held = self.db.read(|conn| deferred::all(conn))?;
        for change in &held {
            self.tally(self.apply_remote(change)?, report);
        }

        let mut cursor = since;
        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(cursor);
            }
            let page = match tokio::time::timeout(
                self.settings.request_timeout,
                self.remote
                    .pull(cursor.as_deref(), self.settings.pull_page_size),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SyncError::Transport(format!(
                        "pull timed out after {}s",
                        self.settings.request_timeout.as_secs()
                    )))
                }
            };

            for change in &page.changes {
                self.tally(self.apply_remote(change)?, report);
            }
            let advanced = page.next_cursor.is_some() && page.next_cursor != cursor;
            if page.next_cursor.is_some() {
                cursor = page.next_cursor;
            }
            if !page.has_more || page.changes.is_empty() {
                return Ok(cursor);
            }
            if !advanced {
                warn!(
                    cursor = cursor.as_deref().unwrap_or(""),
                    "Change feed reported more pages without a new cursor; stopping pull"
                );
                return Ok(cursor);
            }
        }
    }

    fn tally(&self, outcome: ApplyOutcome, report: &mut CycleReport) {
        match outcome {
            ApplyOutcome::Applied => report.pulled += 1,
            ApplyOutcome::Deferred => report.deferred += 1,
            ApplyOutcome::Stale => {}
        }
    }

    /// Apply one remote change unless it is already reflected locally or the
    /// entity still has unsent local work, in which case it is held back.
    fn apply_remote(&self, change: &RemoteChange) -> Result<ApplyOutcome> {
        let key = change.key();
        self.db.with_transaction(|tx| {
            let current = versions::remote_version(tx, &key)?;
            if change.version <= current {
                deferred::clear_through(tx, &key, current)?;
                return Ok(ApplyOutcome::Stale);
            }
            if outbox::has_unsent(tx, &key)? {
                deferred::store(tx, change)?;
                debug!(entity = %key, version = change.version, "Deferred remote change behind local work");
                return Ok(ApplyOutcome::Deferred);
            }
            self.sink.apply(tx, &key, change.state(), change.version)?;
            versions::advance(tx, &key, change.version, change.state())?;
            deferred::clear_through(tx, &key, change.version)?;
            Ok(ApplyOutcome::Applied)
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conflict::AdditiveFields;
    use crate::db;
    use crate::model::{EntityKey, NewMutation};
    use crate::remote::{MemoryRemoteStore, PullPage};
    use crate::sink::{synced_entity, SyncedEntityTable};
    use async_trait::async_trait;
    use rusqlite::Connection;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    /// Fails the first local apply, then behaves like the real table.
    struct FailOnceSink {
        failed: AtomicBool,
    }

    impl EntitySink for FailOnceSink {
        fn apply(
            &self,
            conn: &Connection,
            key: &EntityKey,
            state: Option<&Value>,
            remote_version: i64,
        ) -> Result<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(SyncError::Validation("business table constraint".into()));
            }
            SyncedEntityTable.apply(conn, key, state, remote_version)
        }
    }

    /// Cancels `token` as soon as one push has gone through.
    struct CancelOnPush {
        inner: Arc<MemoryRemoteStore>,
        token: CancellationToken,
    }

    #[async_trait]
    impl RemoteStore for CancelOnPush {
        async fn probe(&self) -> Result<()> {
            self.inner.probe().await
        }

        async fn push(&self, request: &PushRequest) -> Result<PushAck> {
            let ack = self.inner.push(request).await;
            self.token.cancel();
            ack
        }

        async fn pull(&self, since: Option<&str>, limit: usize) -> Result<PullPage> {
            self.inner.pull(since, limit).await
        }
    }

    /// A feed that always claims more pages but never hands out a cursor.
    struct StuckFeed {
        inner: Arc<MemoryRemoteStore>,
        pulls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RemoteStore for StuckFeed {
        async fn probe(&self) -> Result<()> {
            self.inner.probe().await
        }

        async fn push(&self, request: &PushRequest) -> Result<PushAck> {
            self.inner.push(request).await
        }

        async fn pull(&self, _since: Option<&str>, _limit: usize) -> Result<PullPage> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(PullPage {
                changes: vec![RemoteChange {
                    entity_type: "product".into(),
                    entity_id: "X".into(),
                    operation: Operation::Update,
                    version: 1,
                    base_version: 0,
                    payload: Some(json!({ "qty": 7 })),
                }],
                next_cursor: None,
                has_more: true,
            })
        }
    }

    struct Harness {
        db: Arc<DbState>,
        remote: Arc<MemoryRemoteStore>,
        clock: Arc<ManualClock>,
        worker: SyncWorker,
        checkpoint: SyncCheckpoint,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_merges(MergeRegistry::new())
        }

        fn with_merges(merges: MergeRegistry) -> Self {
            Self::with_parts(merges, Arc::new(SyncedEntityTable), |remote| {
                remote as Arc<dyn RemoteStore>
            })
        }

        /// `wrap` puts a test double in front of the in-memory remote.
        fn with_parts<F>(merges: MergeRegistry, sink: Arc<dyn EntitySink>, wrap: F) -> Self
        where
            F: FnOnce(Arc<MemoryRemoteStore>) -> Arc<dyn RemoteStore>,
        {
            let db = Arc::new(db::open_in_memory().expect("open in-memory db"));
            let remote = Arc::new(MemoryRemoteStore::new());
            let front = wrap(remote.clone());
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let monitor = Arc::new(ConnectivityMonitor::new(
                front.clone(),
                Duration::from_secs(2),
                Duration::from_secs(30),
            ));
            let worker = SyncWorker::new(
                db.clone(),
                front,
                monitor,
                merges,
                sink,
                clock.clone(),
                WorkerSettings {
                    batch_size: 10,
                    pull_page_size: 3,
                    backoff: BackoffPolicy::default(),
                    request_timeout: Duration::from_secs(5),
                    retention: Duration::from_secs(30 * 24 * 3600),
                },
            );
            Self {
                db,
                remote,
                clock,
                worker,
                checkpoint: SyncCheckpoint::default(),
            }
        }

        fn capture(&self, mutation: NewMutation) -> MutationRecord {
            self.db
                .with_transaction(|tx| outbox::append(tx, &mutation, self.clock.now()))
                .expect("capture")
        }

        async fn cycle(&mut self) -> CycleReport {
            let (report, checkpoint) = self
                .worker
                .run_cycle(self.checkpoint.clone(), &CancellationToken::new())
                .await
                .expect("cycle");
            self.checkpoint = checkpoint;
            report
        }

        fn record(&self, id: i64) -> MutationRecord {
            outbox::get(&self.db, id).unwrap().expect("record exists")
        }

        fn local_state(&self, key: &EntityKey) -> Option<Value> {
            self.db
                .read(|conn| synced_entity(conn, key))
                .unwrap()
                .and_then(|e| e.state)
        }
    }

    #[tokio::test]
    async fn test_pushes_pending_records_and_advances_checkpoint() {
        let mut h = Harness::new();
        let rec = h.capture(NewMutation::create(EntityKey::new("product", "P1"), json!({ "qty": 3 })));

        let report = h.cycle().await;
        assert!(report.is_clean());
        assert_eq!(report.pushed, 1);

        let stored = h.record(rec.id);
        assert_eq!(stored.status, MutationStatus::Settled);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(
            h.remote.entity(&rec.key),
            Some((1, Some(json!({ "qty": 3 }))))
        );
        assert!(h.checkpoint.last_full_sync_at.is_some());
        // Our own change comes back through the feed and is ignored.
        assert_eq!(h.checkpoint.last_seen_cursor.as_deref(), Some("1"));
        assert_eq!(report.pulled, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_settle() {
        let mut h = Harness::new();
        let sale = h.capture(NewMutation::create(
            EntityKey::new("sale", "S100"),
            json!({ "total": 12.5 }),
        ));
        h.remote.fail_next_pushes(3);

        let mut delays = Vec::new();
        for _ in 0..3 {
            let failed_at = h.clock.now();
            let report = h.cycle().await;
            assert_eq!(report.retrying, 1);
            assert!(report.error.is_some());

            let stored = h.record(sale.id);
            assert_eq!(stored.status, MutationStatus::Pending);
            let due = stored.next_retry_at.expect("retry scheduled");
            delays.push((due - failed_at).num_milliseconds());

            // Nothing is sent before the record is due.
            h.clock.set(due - ChronoDuration::milliseconds(1));
            let early = h.cycle().await;
            assert_eq!(early.pushed + early.retrying, 0);
            h.clock.set(due);
        }

        for (delay, expected) in delays.iter().zip([2_000, 4_000, 8_000]) {
            assert!(*delay >= expected && *delay <= expected + expected / 10, "{delays:?}");
        }

        let report = h.cycle().await;
        assert_eq!(report.pushed, 1);
        let stored = h.record(sale.id);
        assert_eq!(stored.status, MutationStatus::Settled);
        assert_eq!(stored.attempt_count, 4);
        assert_eq!(h.checkpoint.consecutive_failures, 0);
        assert_eq!(h.remote.push_attempts(), 4);
    }

    #[tokio::test]
    async fn test_validation_rejection_is_terminal_and_others_proceed() {
        let mut h = Harness::new();
        let bad = h.capture(NewMutation::create(EntityKey::new("product", "BAD"), json!({ "qty": -1 })));
        let good = h.capture(NewMutation::create(EntityKey::new("product", "OK"), json!({ "qty": 1 })));
        h.remote.reject(EntityKey::new("product", "BAD"));

        let report = h.cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.pushed, 1);
        assert!(report.is_clean());

        let stored = h.record(bad.id);
        assert_eq!(stored.status, MutationStatus::Failed);
        assert!(stored.last_error.unwrap().contains("rejected"));
        assert_eq!(h.record(good.id).status, MutationStatus::Settled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_skips_cycle_without_pushing() {
        let mut h = Harness::new();
        let rec = h.capture(NewMutation::create(EntityKey::new("product", "P1"), json!({ "qty": 1 })));
        h.remote.set_probe_delay(Some(Duration::from_secs(60)));

        let report = h.cycle().await;
        assert_eq!(report.skipped, Some(SkipReason::Offline));
        assert_eq!(h.remote.push_attempts(), 0);
        assert_eq!(h.record(rec.id).status, MutationStatus::Pending);
        assert_eq!(h.checkpoint, SyncCheckpoint::default());
    }

    #[tokio::test]
    async fn test_divergent_update_is_merged_and_audited() {
        let merges = MergeRegistry::new().with("customer", Arc::new(AdditiveFields::new(["points"])));
        let mut h = Harness::with_merges(merges);
        let key = EntityKey::new("customer", "C7");

        // Both sides start from version 1.
        h.remote
            .apply_external(&key, Operation::Create, Some(json!({ "name": "Ana", "points": 10 })))
            .unwrap();
        h.cycle().await;
        assert_eq!(h.local_state(&key), Some(json!({ "name": "Ana", "points": 10 })));

        // The cloud moves twice, the terminal once against version 1.
        h.remote
            .apply_external(&key, Operation::Update, Some(json!({ "name": "Ana B", "points": 10 })))
            .unwrap();
        h.remote
            .apply_external(&key, Operation::Update, Some(json!({ "name": "Ana B", "points": 15 })))
            .unwrap();
        let local = h.capture(NewMutation::update(key.clone(), json!({ "name": "Ana", "points": 12 })));
        assert_eq!(local.base_version, 1);

        let report = h.cycle().await;
        assert_eq!(report.merged, 1);

        let expected = json!({ "name": "Ana B", "points": 17 });
        assert_eq!(h.local_state(&key), Some(expected.clone()));
        assert_eq!(h.remote.entity(&key), Some((4, Some(expected.clone()))));
        assert_eq!(h.record(local.id).status, MutationStatus::Settled);

        let conflicts = audit::list(&h.db, Some(&key), 10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution, "merged");
        assert_eq!(conflicts[0].resolved_payload, Some(expected));
        assert_eq!(conflicts[0].remote_version, 3);
    }

    #[tokio::test]
    async fn test_remote_wins_without_strategy() {
        let mut h = Harness::new();
        let key = EntityKey::new("customer", "C7");
        h.remote
            .apply_external(&key, Operation::Create, Some(json!({ "name": "Ana" })))
            .unwrap();
        h.cycle().await;

        h.remote
            .apply_external(&key, Operation::Update, Some(json!({ "name": "Ana B" })))
            .unwrap();
        h.remote
            .apply_external(&key, Operation::Update, Some(json!({ "name": "Ana C" })))
            .unwrap();
        let local = h.capture(NewMutation::update(key.clone(), json!({ "name": "Anna" })));

        let report = h.cycle().await;
        assert_eq!(report.conflicted, 1);
        assert_eq!(h.record(local.id).status, MutationStatus::Conflicted);
        assert_eq!(h.local_state(&key), Some(json!({ "name": "Ana C" })));
        assert_eq!(audit::list(&h.db, Some(&key), 10).unwrap()[0].resolution, "remote_wins");
    }

    #[tokio::test]
    async fn test_remote_delete_wins_over_local_update() {
        let mut h = Harness::new();
        let key = EntityKey::new("product", "P9");
        h.remote
            .apply_external(&key, Operation::Create, Some(json!({ "qty": 1 })))
            .unwrap();
        h.cycle().await;

        h.remote.apply_external(&key, Operation::Delete, None).unwrap();
        let local = h.capture(NewMutation::update(key.clone(), json!({ "qty": 2 })));

        let report = h.cycle().await;
        assert_eq!(report.conflicted, 1);
        assert_eq!(h.record(local.id).status, MutationStatus::Conflicted);
        let entity = h.db.read(|conn| synced_entity(conn, &key)).unwrap().unwrap();
        assert!(entity.deleted);
        assert_eq!(h.remote.entity(&key), Some((2, None)));
    }

    #[tokio::test]
    async fn test_concurrent_writes_from_same_base_are_replayed_without_audit() {
        let mut h = Harness::new();
        let key = EntityKey::new("product", "P1");
        h.remote
            .apply_external(&key, Operation::Create, Some(json!({ "qty": 1, "name": "Tea" })))
            .unwrap();
        // Captured before this terminal ever saw the remote row: both sides
        // were written against version 0.
        let local = h.capture(NewMutation::update(key.clone(), json!({ "qty": 5, "name": "Tea" })));
        assert_eq!(local.base_version, 0);

        let report = h.cycle().await;
        assert_eq!(report.merged, 1);
        assert_eq!(h.record(local.id).status, MutationStatus::Settled);

        let expected = json!({ "qty": 5, "name": "Tea" });
        assert_eq!(h.local_state(&key), Some(expected.clone()));
        assert_eq!(h.remote.entity(&key), Some((2, Some(expected))));
        assert!(audit::list(&h.db, Some(&key), 10).unwrap().is_empty());
        assert_eq!(h.db.read(|conn| deferred::count(conn)).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pull_defers_then_applies_after_local_work_settles() {
        let mut h = Harness::new();
        let mine = EntityKey::new("product", "P1");
        let theirs = EntityKey::new("product", "P2");

        // An in-flight record for P1 makes remote P1 changes wait.
        h.capture(NewMutation::create(mine.clone(), json!({ "qty": 1 })));
        outbox::next_batch(&h.db, 10, h.clock.now()).unwrap();

        h.remote
            .apply_external(&theirs, Operation::Create, Some(json!({ "qty": 7 })))
            .unwrap();
        let (report, cursor) = {
            let mut report = CycleReport::default();
            let cursor = h
                .worker
                .pull_phase(None, &mut report, &CancellationToken::new())
                .await
                .unwrap();
            (report, cursor)
        };
        assert_eq!(report.pulled, 1);
        assert_eq!(cursor.as_deref(), Some("1"));
        assert_eq!(h.local_state(&theirs), Some(json!({ "qty": 7 })));

        let remote_p1 = RemoteChange {
            entity_type: "product".into(),
            entity_id: "P1".into(),
            operation: Operation::Update,
            version: 5,
            base_version: 4,
            payload: Some(json!({ "qty": 50 })),
        };
        assert_eq!(h.worker.apply_remote(&remote_p1).unwrap(), ApplyOutcome::Deferred);
        assert_eq!(h.local_state(&mine), None);

        outbox::mark_settled(&h.db, 1, h.clock.now()).unwrap();

        let mut report = CycleReport::default();
        h.worker
            .pull_phase(cursor, &mut report, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(h.local_state(&mine), Some(json!({ "qty": 50 })));
        assert_eq!(h.db.read(|conn| deferred::count(conn)).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_leaves_records_pending() {
        let h = Harness::new();
        let rec = h.capture(NewMutation::create(EntityKey::new("product", "P1"), json!({ "qty": 1 })));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (report, checkpoint) = h
            .worker
            .run_cycle(SyncCheckpoint::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.skipped, Some(SkipReason::ShuttingDown));
        assert_eq!(checkpoint, SyncCheckpoint::default());
        assert_eq!(h.record(rec.id).status, MutationStatus::Pending);
        assert_eq!(h.remote.push_attempts(), 0);
    }

    #[tokio::test]
    async fn test_no_lost_updates_across_failures() {
        let mut h = Harness::new();
        let keys: Vec<EntityKey> = (0..12).map(|i| EntityKey::new("product", format!("P{i}"))).collect();

        let mut last: Vec<Value> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            h.capture(NewMutation::create(key.clone(), json!({ "qty": i })));
            last.push(json!({ "qty": i }));
        }
        h.remote.fail_next_pushes(2);
        h.cycle().await;

        for round in 1..4 {
            for (i, key) in keys.iter().enumerate().filter(|(i, _)| i % round == 0) {
                let state = json!({ "qty": i * 10 + round });
                h.capture(NewMutation::update(key.clone(), state.clone()));
                last[i] = state;
            }
            if round == 2 {
                h.remote.fail_next_pushes(1);
            }
            h.clock.advance(Duration::from_secs(600));
            h.cycle().await;
        }

        for _ in 0..5 {
            h.clock.advance(Duration::from_secs(600));
            h.cycle().await;
        }

        let counts = h.db.read(|conn| outbox::counts(conn)).unwrap();
        assert_eq!(counts.unsent(), 0);
        assert_eq!(counts.failed + counts.conflicted, 0);
        for (key, expected) in keys.iter().zip(&last) {
            let (_, state) = h.remote.entity(key).expect("entity pushed");
            assert_eq!(state.as_ref(), Some(expected), "{key}");
        }
    }

    #[tokio::test]
    async fn test_second_concurrent_cycle_is_rejected() {
        let h = Harness::new();
        h.worker.busy.store(true, Ordering::Release);
        let err = h
            .worker
            .run_cycle(SyncCheckpoint::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CycleInProgress));
        assert!(h.worker.is_running());
    }

    #[tokio::test]
    async fn test_local_apply_error_returns_record_to_pending() {
        let sink = Arc::new(FailOnceSink {
            failed: AtomicBool::new(false),
        });
        let mut h = Harness::with_parts(MergeRegistry::new(), sink, |remote| {
            remote as Arc<dyn RemoteStore>
        });
        let rec = h.capture(NewMutation::create(EntityKey::new("product", "P1"), json!({ "qty": 4 })));

        let report = h.cycle().await;
        assert!(report.error.is_some());
        assert_eq!(report.pushed, 0);
        let stored = h.record(rec.id);
        assert_eq!(stored.status, MutationStatus::Pending);
        assert_eq!(stored.attempt_count, 0);
        // The remote took it even though the local write failed.
        assert_eq!(h.remote.entity(&rec.key), Some((1, Some(json!({ "qty": 4 })))));
        assert_eq!(h.checkpoint.consecutive_failures, 1);
        assert!(h.checkpoint.last_full_sync_at.is_none());

        // The resend carries the same idempotency key and settles.
        let report = h.cycle().await;
        assert!(report.is_clean());
        assert_eq!(report.pushed, 1);
        assert_eq!(h.record(rec.id).status, MutationStatus::Settled);
        assert_eq!(h.remote.push_attempts(), 2);
        assert_eq!(h.remote.entity(&rec.key).map(|(v, _)| v), Some(1));
        assert_eq!(h.local_state(&rec.key), Some(json!({ "qty": 4 })));
        assert_eq!(h.checkpoint.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_records_left_in_flight_are_sent_next_cycle() {
        let mut h = Harness::new();
        let rec = h.capture(NewMutation::create(EntityKey::new("product", "P1"), json!({ "qty": 1 })));
        let claimed = outbox::next_batch(&h.db, 10, h.clock.now()).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(h.record(rec.id).status, MutationStatus::InFlight);

        let report = h.cycle().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(h.record(rec.id).status, MutationStatus::Settled);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_releases_untransmitted_records() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let h = Harness::with_parts(MergeRegistry::new(), Arc::new(SyncedEntityTable), |remote| {
            Arc::new(CancelOnPush {
                inner: remote,
                token,
            }) as Arc<dyn RemoteStore>
        });
        let recs: Vec<MutationRecord> = ["P1", "P2", "P3"]
            .iter()
            .map(|id| h.capture(NewMutation::create(EntityKey::new("product", *id), json!({ "qty": 1 }))))
            .collect();

        let (report, checkpoint) = h
            .worker
            .run_cycle(SyncCheckpoint::default(), &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.pushed, 1);
        assert_eq!(h.remote.push_attempts(), 1);
        assert_eq!(h.record(recs[0].id).status, MutationStatus::Settled);
        for rec in &recs[1..] {
            let stored = h.record(rec.id);
            assert_eq!(stored.status, MutationStatus::Pending);
            assert_eq!(stored.attempt_count, 0);
        }
        assert_eq!(checkpoint, SyncCheckpoint::default());
    }

    #[tokio::test]
    async fn test_pull_stops_when_feed_cursor_does_not_advance() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        let mut h = Harness::with_parts(MergeRegistry::new(), Arc::new(SyncedEntityTable), |remote| {
            Arc::new(StuckFeed {
                inner: remote,
                pulls: counter,
            }) as Arc<dyn RemoteStore>
        });

        let report = tokio::time::timeout(Duration::from_secs(5), h.cycle())
            .await
            .expect("pull loop terminates");
        assert_eq!(pulls.load(Ordering::SeqCst), 1);
        assert_eq!(report.pulled, 1);
        assert_eq!(
            h.local_state(&EntityKey::new("product", "X")),
            Some(json!({ "qty": 7 }))
        );
        assert_eq!(h.checkpoint.last_seen_cursor, None);
    }
}
