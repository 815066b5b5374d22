//! Background sync scheduling.
//!
//! One tokio task owns the worker. It runs a cycle every interval when auto
//! sync is on and whenever `run_now` is called. A trigger that arrives while
//! a cycle is running does not start a second one: it sets the rerun flag
//! and is answered by the cycle that follows. The current state is
//! published on a `watch` channel.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::worker::{CycleReport, SyncWorker};

const TRIGGER_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    #[serde(rename_all = "camelCase")]
    Scheduled {
        next_run_at: DateTime<Utc>,
    },
    Running,
    Stopped,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Scheduled { .. } => "scheduled",
            SchedulerState::Running => "running",
            SchedulerState::Stopped => "stopped",
        }
    }
}

enum Command {
    RunNow(oneshot::Sender<CycleReport>),
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    pub interval: Duration,
    pub auto_sync: bool,
}

pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    state: watch::Receiver<SchedulerState>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Start the scheduler task. Must be called from within a tokio runtime.
pub fn spawn(
    worker: Arc<SyncWorker>,
    db: Arc<DbState>,
    settings: ScheduleSettings,
    cancel: CancellationToken,
) -> SchedulerHandle {
    let (tx, rx) = mpsc::channel(TRIGGER_QUEUE);
    let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
    let task = SchedulerTask {
        worker,
        db,
        settings,
        cancel: cancel.clone(),
        rx,
        state: state_tx,
    };
    let join = tokio::spawn(task.run());
    SchedulerHandle {
        tx,
        cancel,
        state: state_rx,
        join: Mutex::new(Some(join)),
    }
}

impl SchedulerHandle {
    /// Ask for a cycle now and wait for its report. Coalesces with a cycle
    /// already in progress by waiting for the rerun after it.
    pub async fn run_now(&self) -> Result<CycleReport> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::RunNow(reply_tx))
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        reply_rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Stop scheduling and wait for the task to exit. A cycle in progress
    /// stops before its next transmission.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let join = self.join.lock().ok().and_then(|mut guard| guard.take());
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!("Sync scheduler task ended abnormally: {e}");
            }
        }
    }
}

struct SchedulerTask {
    worker: Arc<SyncWorker>,
    db: Arc<DbState>,
    settings: ScheduleSettings,
    cancel: CancellationToken,
    rx: mpsc::Receiver<Command>,
    state: watch::Sender<SchedulerState>,
}

impl SchedulerTask {
    async fn run(mut self) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            auto_sync = self.settings.auto_sync,
            "Sync scheduler started"
        );

        'outer: loop {
            let mut waiters: Vec<oneshot::Sender<CycleReport>> = Vec::new();
            let deadline = self
                .settings
                .auto_sync
                .then(|| tokio::time::Instant::now() + self.settings.interval);

            match deadline {
                Some(_) => {
                    let next_run_at = Utc::now()
                        + ChronoDuration::from_std(self.settings.interval)
                            .unwrap_or_else(|_| ChronoDuration::minutes(30));
                    self.state.send_replace(SchedulerState::Scheduled { next_run_at });
                }
                None => {
                    self.state.send_replace(SchedulerState::Idle);
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'outer,
                cmd = self.rx.recv() => match cmd {
                    Some(Command::RunNow(reply)) => {
                        debug!("Manual sync requested");
                        waiters.push(reply);
                    }
                    None => break 'outer,
                },
                _ = sleep_until(deadline) => {
                    debug!("Scheduled sync due");
                }
            }

            loop {
                self.state.send_replace(SchedulerState::Running);
                let report = run_one(&self.worker, &self.db, &self.cancel).await;

                let mut rerun = Vec::new();
                while let Ok(Command::RunNow(reply)) = self.rx.try_recv() {
                    rerun.push(reply);
                }
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(report.clone());
                }

                if self.cancel.is_cancelled() {
                    // Dropped senders tell the callers the engine is stopping.
                    break 'outer;
                }
                if rerun.is_empty() {
                    break;
                }
                info!(requests = rerun.len(), "Sync requested during cycle; running again");
                waiters = rerun;
            }
        }

        self.state.send_replace(SchedulerState::Stopped);
        self.rx.close();
        info!("Sync scheduler stopped");
    }
}

/// Load the checkpoint, run one cycle, persist what it produced.
async fn run_one(worker: &SyncWorker, db: &DbState, cancel: &CancellationToken) -> CycleReport {
    let loaded = match db.read(|conn| checkpoint::load(conn)) {
        Ok(cp) => cp,
        Err(e) => {
            warn!("Failed to load sync checkpoint: {e}");
            return CycleReport::failed(&e, worker.now());
        }
    };

    match worker.run_cycle(loaded.clone(), cancel).await {
        Ok((report, updated)) => {
            if updated != loaded {
                if let Err(e) = checkpoint::save(db, &updated) {
                    warn!("Failed to persist sync checkpoint: {e}");
                }
            }
            report
        }
        Err(e) => {
            warn!("Sync cycle aborted: {e}");
            let mut failed = loaded;
            failed.consecutive_failures = failed.consecutive_failures.saturating_add(1);
            failed.last_error = Some(e.to_string());
            if let Err(save_err) = checkpoint::save(db, &failed) {
                warn!("Failed to persist sync checkpoint: {save_err}");
            }
            CycleReport::failed(&e, worker.now())
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::conflict::MergeRegistry;
    use crate::connectivity::ConnectivityMonitor;
    use crate::db;
    use crate::model::{EntityKey, NewMutation, MutationStatus};
    use crate::outbox;
    use crate::remote::{MemoryRemoteStore, PullPage, PushAck, PushRequest, RemoteStore};
    use crate::sink::SyncedEntityTable;
    use crate::worker::{SkipReason, WorkerSettings};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, Semaphore};

    struct Fixture {
        db: Arc<DbState>,
        remote: Arc<MemoryRemoteStore>,
        handle: SchedulerHandle,
    }

    fn spawn_over(
        remote: Arc<dyn RemoteStore>,
        auto_sync: bool,
        interval: Duration,
    ) -> (Arc<DbState>, SchedulerHandle) {
        let db = Arc::new(db::open_in_memory().expect("open in-memory db"));
        let monitor = Arc::new(ConnectivityMonitor::new(
            remote.clone(),
            Duration::from_secs(2),
            Duration::from_secs(30),
        ));
        let worker = Arc::new(SyncWorker::new(
            db.clone(),
            remote,
            monitor,
            MergeRegistry::new(),
            Arc::new(SyncedEntityTable),
            Arc::new(SystemClock),
            WorkerSettings::default(),
        ));
        let handle = spawn(
            worker,
            db.clone(),
            ScheduleSettings {
                interval,
                auto_sync,
            },
            CancellationToken::new(),
        );
        (db, handle)
    }

    fn start(auto_sync: bool, interval: Duration) -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (db, handle) = spawn_over(remote.clone(), auto_sync, interval);
        Fixture { db, remote, handle }
    }

    /// Holds every push until the test opens the gate.
    struct GatedRemote {
        inner: MemoryRemoteStore,
        gate: Semaphore,
        entered: Notify,
        pulls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for GatedRemote {
        async fn probe(&self) -> Result<()> {
            self.inner.probe().await
        }

        async fn push(&self, request: &PushRequest) -> Result<PushAck> {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await.map_err(|_| SyncError::ShuttingDown)?;
            self.inner.push(request).await
        }

        async fn pull(&self, since: Option<&str>, limit: usize) -> Result<PullPage> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            self.inner.pull(since, limit).await
        }
    }

    #[tokio::test]
    async fn test_run_now_pushes_and_persists_checkpoint() {
        let f = start(false, Duration::from_secs(1800));
        let rec = outbox::capture(
            &f.db,
            &NewMutation::create(EntityKey::new("product", "P1"), json!({ "qty": 1 })),
        )
        .unwrap();

        let report = f.handle.run_now().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(
            outbox::get(&f.db, rec.id).unwrap().unwrap().status,
            MutationStatus::Settled
        );
        let saved = f.db.read(|conn| checkpoint::load(conn)).unwrap();
        assert!(saved.last_full_sync_at.is_some());
        assert_eq!(f.handle.state(), SchedulerState::Idle);

        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_triggers_share_cycles() {
        let f = start(false, Duration::from_secs(1800));
        outbox::capture(
            &f.db,
            &NewMutation::create(EntityKey::new("product", "P1"), json!({ "qty": 1 })),
        )
        .unwrap();

        let (a, b, c) = tokio::join!(f.handle.run_now(), f.handle.run_now(), f.handle.run_now());
        let reports = [a.unwrap(), b.unwrap(), c.unwrap()];
        let total_pushed: usize = reports.iter().map(|r| r.pushed).sum();
        // The record is pushed once however the triggers were grouped.
        assert!(total_pushed >= 1);
        assert_eq!(f.remote.push_attempts(), 1);

        f.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_runs_on_interval() {
        let f = start(true, Duration::from_secs(60));
        let mut states = f.handle.subscribe();
        assert!(matches!(
            *states.wait_for(|s| matches!(s, SchedulerState::Scheduled { .. })).await.unwrap(),
            SchedulerState::Scheduled { .. }
        ));

        outbox::capture(
            &f.db,
            &NewMutation::create(EntityKey::new("product", "P1"), json!({ "qty": 1 })),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        states
            .wait_for(|s| matches!(s, SchedulerState::Scheduled { .. }))
            .await
            .unwrap();

        assert_eq!(f.remote.push_attempts(), 1);
        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_task_and_rejects_triggers() {
        let f = start(true, Duration::from_secs(1800));
        f.handle.shutdown().await;
        assert_eq!(f.handle.state(), SchedulerState::Stopped);
        assert!(matches!(f.handle.run_now().await, Err(SyncError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_offline_cycle_reports_skip() {
        let f = start(false, Duration::from_secs(1800));
        f.remote.set_offline(true);
        let report = f.handle.run_now().await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Offline));
        f.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_triggers_during_cycle_share_one_follow_up_cycle() {
        let remote = Arc::new(GatedRemote {
            inner: MemoryRemoteStore::new(),
            gate: Semaphore::new(0),
            entered: Notify::new(),
            pulls: AtomicUsize::new(0),
        });
        let (db, handle) = spawn_over(remote.clone(), false, Duration::from_secs(1800));
        let handle = Arc::new(handle);
        outbox::capture(
            &db,
            &NewMutation::create(EntityKey::new("product", "A"), json!({ "qty": 1 })),
        )
        .unwrap();

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.run_now().await }
        });
        remote.entered.notified().await;
        assert_eq!(handle.state(), SchedulerState::Running);

        // Captured while the first cycle is blocked on a push.
        outbox::capture(
            &db,
            &NewMutation::create(EntityKey::new("product", "B"), json!({ "qty": 2 })),
        )
        .unwrap();
        let second = tokio::spawn({
            let handle = handle.clone();
            async move { handle.run_now().await }
        });
        let third = tokio::spawn({
            let handle = handle.clone();
            async move { handle.run_now().await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        remote.gate.add_permits(10);

        let r1 = first.await.unwrap().unwrap();
        let r2 = second.await.unwrap().unwrap();
        let r3 = third.await.unwrap().unwrap();

        // The running cycle picks up B after A; the follow-up finds nothing.
        assert_eq!(r1.pushed, 2);
        assert_eq!(r2, r3);
        assert_eq!(r2.pushed, 0);
        assert!(r1.finished_at.is_some());
        assert!(r2.started_at >= r1.finished_at);
        // One pull per cycle: the triggered cycle plus exactly one rerun.
        assert_eq!(remote.pulls.load(Ordering::SeqCst), 2);
        assert_eq!(remote.inner.push_attempts(), 2);

        handle.shutdown().await;
    }
}
