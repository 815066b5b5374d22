//! The sync engine as one handle: local database, background scheduler and
//! the operator surface (run now, status, retry, conflicts).

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::audit;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict::MergeRegistry;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, DbState};
use crate::error::Result;
use crate::model::{ConflictRecord, EntityKey, MutationRecord, MutationStatus, NewMutation};
use crate::outbox;
use crate::remote::{HttpRemoteStore, RemoteStore};
use crate::scheduler::{self, ScheduleSettings, SchedulerHandle, SchedulerState};
use crate::sink::{EntitySink, SyncedEntityTable};
use crate::status::{self, SyncStatus};
use crate::worker::{CycleReport, SkipReason, SyncWorker, WorkerSettings};

/// Everything the engine needs besides configuration.
pub struct EngineParts {
    pub db: Arc<DbState>,
    /// `None` when sync is disabled.
    pub remote: Option<Arc<dyn RemoteStore>>,
    pub merges: MergeRegistry,
    pub sink: Arc<dyn EntitySink>,
    pub clock: Arc<dyn Clock>,
}

struct Running {
    monitor: Arc<ConnectivityMonitor>,
    scheduler: SchedulerHandle,
}

pub struct SyncEngine {
    db: Arc<DbState>,
    running: Option<Running>,
}

impl SyncEngine {
    /// Open the on-disk database and, when sync is enabled, start the
    /// scheduler against the configured HTTP remote. Must be called from
    /// within a tokio runtime.
    pub fn open(config: &SyncConfig, merges: MergeRegistry) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(db::init(&config.db_path())?);
        let remote: Option<Arc<dyn RemoteStore>> = if config.enabled {
            Some(Arc::new(HttpRemoteStore::from_config(config)?))
        } else {
            None
        };
        Self::with_parts(
            config,
            EngineParts {
                db,
                remote,
                merges,
                sink: Arc::new(SyncedEntityTable),
                clock: Arc::new(SystemClock),
            },
        )
    }

    pub fn with_parts(config: &SyncConfig, parts: EngineParts) -> Result<Self> {
        outbox::recover_in_flight(&parts.db)?;

        let remote = match parts.remote {
            Some(remote) if config.enabled => remote,
            _ => {
                info!("Cloud sync disabled; mutations are recorded locally only");
                return Ok(Self {
                    db: parts.db,
                    running: None,
                });
            }
        };

        let monitor = Arc::new(ConnectivityMonitor::new(
            remote.clone(),
            config.probe_timeout,
            config.probe_cache_ttl,
        ));
        let worker = Arc::new(SyncWorker::new(
            parts.db.clone(),
            remote,
            monitor.clone(),
            parts.merges,
            parts.sink,
            parts.clock,
            WorkerSettings::from_config(config),
        ));
        let scheduler = scheduler::spawn(
            worker,
            parts.db.clone(),
            ScheduleSettings {
                interval: config.interval,
                auto_sync: config.auto_sync,
            },
            CancellationToken::new(),
        );
        info!(
            interval_secs = config.interval.as_secs(),
            auto_sync = config.auto_sync,
            "Sync engine started"
        );

        Ok(Self {
            db: parts.db,
            running: Some(Running { monitor, scheduler }),
        })
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn is_enabled(&self) -> bool {
        self.running.is_some()
    }

    /// Record a local write. Never touches the network.
    pub fn capture(&self, mutation: &NewMutation) -> Result<MutationRecord> {
        outbox::capture(&self.db, mutation)
    }

    /// Run a cycle now and wait for its report.
    pub async fn run_now(&self) -> Result<CycleReport> {
        match &self.running {
            Some(running) => running.scheduler.run_now().await,
            None => Ok(CycleReport::skipped(SkipReason::Disabled, chrono::Utc::now())),
        }
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let (reachable, scheduler) = match &self.running {
            Some(running) => (running.monitor.cached(), running.scheduler.state()),
            None => (None, SchedulerState::Stopped),
        };
        status::snapshot(&self.db, self.is_enabled(), reachable, scheduler)
    }

    /// Give a terminally failed record another attempt budget.
    pub fn retry(&self, id: i64) -> Result<()> {
        outbox::requeue_failed(&self.db, id)
    }

    pub fn failed(&self, limit: usize) -> Result<Vec<MutationRecord>> {
        outbox::list(&self.db, Some(MutationStatus::Failed), limit)
    }

    pub fn conflicts(&self, key: Option<&EntityKey>, limit: usize) -> Result<Vec<ConflictRecord>> {
        audit::list(&self.db, key, limit)
    }

    /// Stop the scheduler. Later `run_now` calls fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        if let Some(running) = &self.running {
            running.scheduler.shutdown().await;
        }
    }
}
