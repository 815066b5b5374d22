//! Offline-first sync engine for the POS.
//!
//! Every local write is captured in a durable outbox (`outbox`) on the
//! caller's thread. A background scheduler (`scheduler`) drives the worker
//! (`worker`), which pushes pending mutations to the remote store, resolves
//! conflicts (`conflict`) and pulls the remote change feed. `SyncEngine`
//! bundles the pieces for applications and the `pos-sync` binary.

pub mod audit;
pub mod backoff;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod db;
pub mod deferred;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod outbox;
pub mod remote;
pub mod scheduler;
pub mod sink;
pub mod status;
pub mod versions;
pub mod worker;

pub use config::SyncConfig;
pub use conflict::{AdditiveFields, MergeRegistry, MergeStrategy, Resolution, ResolutionKind};
pub use engine::{EngineParts, SyncEngine};
pub use error::{Result, SyncError};
pub use model::{
    ConflictRecord, EntityKey, MutationRecord, MutationStatus, NewMutation, Operation,
    SyncCheckpoint,
};
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteStore};
pub use scheduler::SchedulerState;
pub use status::SyncStatus;
pub use worker::{CycleReport, SkipReason};
