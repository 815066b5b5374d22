//! In-process remote store.
//!
//! Keeps authoritative entity versions and an append-only change feed in
//! memory, with switches to simulate an unreachable server, slow probes,
//! transient push failures and rejected payloads. Also lets callers apply
//! edits as if another terminal had made them.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::{PullPage, PushAck, PushRequest, RemoteChange, RemoteStore};
use crate::error::{Result, SyncError};
use crate::model::{EntityKey, Operation};

#[derive(Debug, Clone)]
struct StoredEntity {
    version: i64,
    state: Option<Value>,
}

#[derive(Default)]
struct MemoryState {
    entities: HashMap<EntityKey, StoredEntity>,
    feed: Vec<RemoteChange>,
    accepted: HashMap<String, i64>,
    offline: bool,
    probe_delay: Option<Duration>,
    failing_pushes: u32,
    rejected: HashSet<EntityKey>,
    push_attempts: usize,
}

#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<MemoryState>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.offline = offline;
        }
    }

    /// Make every probe take `delay` before answering.
    pub fn set_probe_delay(&self, delay: Option<Duration>) {
        if let Ok(mut s) = self.state.lock() {
            s.probe_delay = delay;
        }
    }

    /// Fail the next `count` pushes with a transport error.
    pub fn fail_next_pushes(&self, count: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.failing_pushes = count;
        }
    }

    /// Refuse every push for `key` as invalid.
    pub fn reject(&self, key: EntityKey) {
        if let Ok(mut s) = self.state.lock() {
            s.rejected.insert(key);
        }
    }

    /// Number of push calls received, successful or not.
    pub fn push_attempts(&self) -> usize {
        self.state.lock().map(|s| s.push_attempts).unwrap_or(0)
    }

    /// Current remote version and state of `key`. A deleted entity reports
    /// its tombstone version with `None` state.
    pub fn entity(&self, key: &EntityKey) -> Option<(i64, Option<Value>)> {
        let s = self.state.lock().ok()?;
        s.entities
            .get(key)
            .map(|e| (e.version, e.state.clone()))
    }

    /// Apply a change as another replica would, bumping the remote version.
    pub fn apply_external(
        &self,
        key: &EntityKey,
        operation: Operation,
        payload: Option<Value>,
    ) -> Result<RemoteChange> {
        let mut s = self.state.lock()?;
        let base = s.entities.get(key).map(|e| e.version).unwrap_or(0);
        Ok(commit(&mut s, key, operation, base, payload))
    }
}

fn commit(
    s: &mut MemoryState,
    key: &EntityKey,
    operation: Operation,
    base_version: i64,
    payload: Option<Value>,
) -> RemoteChange {
    let version = base_version + 1;
    let state = match operation {
        Operation::Delete => None,
        _ => payload,
    };
    s.entities.insert(
        key.clone(),
        StoredEntity {
            version,
            state: state.clone(),
        },
    );
    let change = RemoteChange {
        entity_type: key.entity_type.clone(),
        entity_id: key.entity_id.clone(),
        operation,
        version,
        base_version,
        payload: state,
    };
    s.feed.push(change.clone());
    change
}

fn latest_change(s: &MemoryState, key: &EntityKey) -> Option<RemoteChange> {
    s.feed
        .iter()
        .rev()
        .find(|c| c.entity_type == key.entity_type && c.entity_id == key.entity_id)
        .cloned()
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn probe(&self) -> Result<()> {
        let (offline, delay) = {
            let s = self.state.lock()?;
            (s.offline, s.probe_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if offline {
            return Err(SyncError::Transport("remote unreachable".into()));
        }
        Ok(())
    }

    async fn push(&self, request: &PushRequest) -> Result<PushAck> {
        let mut s = self.state.lock()?;
        s.push_attempts += 1;

        if s.offline {
            return Err(SyncError::Transport("remote unreachable".into()));
        }
        if s.failing_pushes > 0 {
            s.failing_pushes -= 1;
            return Err(SyncError::Transport("Sync server error (HTTP 503)".into()));
        }
        let key = request.key();
        if s.rejected.contains(&key) {
            return Err(SyncError::Validation(format!(
                "{key} rejected by remote (HTTP 422)"
            )));
        }
        if let Some(version) = s.accepted.get(&request.idempotency_key) {
            return Ok(PushAck::Accepted {
                remote_version: *version,
            });
        }

        let current = s.entities.get(&key).cloned();
        let current_version = current.as_ref().map(|e| e.version).unwrap_or(0);

        // Deleting something that is already gone is a no-op, not a conflict.
        if request.operation == Operation::Delete
            && current.as_ref().is_some_and(|e| e.state.is_none())
        {
            s.accepted
                .insert(request.idempotency_key.clone(), current_version);
            return Ok(PushAck::Accepted {
                remote_version: current_version,
            });
        }

        if request.base_version != current_version {
            return match latest_change(&s, &key) {
                Some(remote) => Ok(PushAck::Conflict { remote }),
                None => Err(SyncError::Validation(format!(
                    "{key}: base version {} is ahead of remote",
                    request.base_version
                ))),
            };
        }

        let change = commit(
            &mut s,
            &key,
            request.operation,
            current_version,
            request.payload.clone(),
        );
        s.accepted
            .insert(request.idempotency_key.clone(), change.version);
        Ok(PushAck::Accepted {
            remote_version: change.version,
        })
    }

    async fn pull(&self, since: Option<&str>, limit: usize) -> Result<PullPage> {
        let s = self.state.lock()?;
        if s.offline {
            return Err(SyncError::Transport("remote unreachable".into()));
        }
        let start = match since {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| SyncError::Validation(format!("bad cursor {cursor:?}")))?,
            None => 0,
        }
        .min(s.feed.len());
        let end = start.saturating_add(limit.max(1)).min(s.feed.len());
        Ok(PullPage {
            changes: s.feed[start..end].to_vec(),
            next_cursor: Some(end.to_string()),
            has_more: end < s.feed.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product(id: &str) -> EntityKey {
        EntityKey::new("product", id)
    }

    #[tokio::test]
    async fn test_push_against_stale_base_conflicts() {
        let store = MemoryRemoteStore::new();
        store
            .apply_external(&product("P1"), Operation::Create, Some(json!({ "qty": 1 })))
            .unwrap();

        let stale = PushRequest::new(&product("P1"), Operation::Update, 1, 0, Some(json!({ "qty": 2 })));
        let PushAck::Conflict { remote } = store.push(&stale).await.unwrap() else {
            panic!("expected conflict");
        };
        assert_eq!(remote.version, 1);

        let fresh = PushRequest::new(&product("P1"), Operation::Update, 1, 1, Some(json!({ "qty": 2 })));
        assert_eq!(
            store.push(&fresh).await.unwrap(),
            PushAck::Accepted { remote_version: 2 }
        );
        // Replays are recognised by idempotency key.
        assert_eq!(
            store.push(&fresh).await.unwrap(),
            PushAck::Accepted { remote_version: 2 }
        );
        assert_eq!(store.entity(&product("P1")), Some((2, Some(json!({ "qty": 2 })))));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryRemoteStore::new();
        let req = PushRequest::new(&product("P1"), Operation::Create, 1, 0, Some(json!({ "qty": 1 })));

        store.fail_next_pushes(1);
        assert!(matches!(store.push(&req).await, Err(SyncError::Transport(_))));
        assert!(store.push(&req).await.is_ok());

        store.reject(product("P2"));
        let bad = PushRequest::new(&product("P2"), Operation::Create, 1, 0, Some(json!({})));
        assert!(matches!(store.push(&bad).await, Err(SyncError::Validation(_))));

        store.set_offline(true);
        assert!(store.probe().await.is_err());
        assert_eq!(store.push_attempts(), 3);
        assert!(matches!(store.push(&req).await, Err(SyncError::Transport(_))));
        assert_eq!(store.push_attempts(), 4);
    }

    #[tokio::test]
    async fn test_pull_pages_through_feed() {
        let store = MemoryRemoteStore::new();
        for id in ["A", "B", "C"] {
            store
                .apply_external(&product(id), Operation::Create, Some(json!({ "qty": 1 })))
                .unwrap();
        }
        let first = store.pull(None, 2).await.unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.has_more);
        let second = store.pull(first.next_cursor.as_deref(), 2).await.unwrap();
        assert_eq!(second.changes.len(), 1);
        assert!(!second.has_more);
        assert_eq!(second.changes[0].entity_id, "C");
    }
}
