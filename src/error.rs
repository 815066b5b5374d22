//! Error taxonomy for the sync engine.
//!
//! Transport and conflict outcomes are recovered inside the engine (retry or
//! resolve). Validation and exhausted-retry outcomes are terminal for a single
//! record and only ever surface through the status snapshot.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote unreachable, timed out, or answered with a server-side failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Remote holds a newer version of the entity than the push was based on.
    #[error("conflict on {entity_type}/{entity_id}: remote is at version {remote_version}")]
    Conflict {
        entity_type: String,
        entity_id: String,
        remote_version: i64,
    },

    /// Malformed payload or a request the remote refuses outright.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("a sync cycle is already running")]
    CycleInProgress,

    #[error("sync engine is shutting down")]
    ShuttingDown,

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("not found: {0}")]
    NotFound(String),
}

impl SyncError {
    /// Whether another attempt at the same record may succeed. A conflict
    /// is retryable when the remote moved again while a resolution was
    /// being pushed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Conflict { .. })
    }

    /// Terminal for the record that produced it: never retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_) | SyncError::ExhaustedRetries { .. }
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned
    }
}
