//! Remote store abstraction.
//!
//! The engine only talks to the authoritative store through `RemoteStore`:
//! a reachability probe, a versioned push and a cursor-paged change feed.
//! `HttpRemoteStore` is the production transport; `MemoryRemoteStore` is an
//! in-process store used by tests and local tooling.

mod http;
mod memory;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::model::{EntityKey, MutationRecord, Operation};

/// A change as published by the remote change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    /// Remote version after this change.
    pub version: i64,
    /// Remote version the change was made against.
    #[serde(default)]
    pub base_version: i64,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl RemoteChange {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Entity state after the change, `None` when deleted.
    pub fn state(&self) -> Option<&Value> {
        match self.operation {
            Operation::Delete => None,
            _ => self.payload.as_ref().filter(|v| !v.is_null()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub local_version: i64,
    pub base_version: i64,
    pub payload: Option<Value>,
    /// Stable per (entity, local version, base) so a retried push is
    /// recognised by the remote.
    pub idempotency_key: String,
}

impl PushRequest {
    pub fn new(
        key: &EntityKey,
        operation: Operation,
        local_version: i64,
        base_version: i64,
        payload: Option<Value>,
    ) -> Self {
        let payload = match operation {
            Operation::Delete => None,
            _ => payload,
        };
        Self {
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            operation,
            local_version,
            base_version,
            payload,
            idempotency_key: format!(
                "{}:{}:{}:{}",
                key.entity_type, key.entity_id, local_version, base_version
            ),
        }
    }

    pub fn from_record(record: &MutationRecord) -> Self {
        Self::new(
            &record.key,
            record.operation,
            record.local_version,
            record.base_version,
            record.payload.clone(),
        )
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// Answer to a push that reached the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum PushAck {
    Accepted { remote_version: i64 },
    /// The remote holds a version newer than the push's base.
    Conflict { remote: RemoteChange },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPage {
    #[serde(default)]
    pub changes: Vec<RemoteChange>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Cheap reachability check. Any error means unreachable.
    async fn probe(&self) -> Result<()>;

    /// Send one mutation. Fails with `SyncError::Transport` when the remote
    /// could not be reached or answered with a server-side failure, and with
    /// `SyncError::Validation` when it refused the request outright.
    async fn push(&self, request: &PushRequest) -> Result<PushAck>;

    /// Changes recorded after `since`, oldest first.
    async fn pull(&self, since: Option<&str>, limit: usize) -> Result<PullPage>;
}
