//! Conflict resolution.
//!
//! `resolve` is a pure function of the two conflicting changes, their common
//! ancestor and the entity type's merge strategy. It never reads the clock
//! or storage, so the same inputs always give the same answer.
//!
//! Policy, in order:
//! 1. Deletes win. A local delete is re-sent; a remote delete overrides the
//!    local write, which is marked conflicted.
//! 2. Identical states have converged.
//! 3. Both changes made against the same base race each other: they are
//!    replayed field by field on top of the ancestor. A field changed on one
//!    side takes that side's value, additive fields add both deltas, and a
//!    field changed differently on both sides keeps the greater of the two
//!    values in canonical JSON order. The outcome does not depend on which
//!    side is called local.
//! 4. Otherwise the remote moved past the local base: additive fields of the
//!    entity type's strategy are merged, every other field takes the remote
//!    value. Without a strategy the remote wins.

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::model::Operation;

/// One side of a conflict.
#[derive(Debug, Clone, Copy)]
pub struct ConflictSide<'a> {
    pub operation: Operation,
    /// Remote version the change was made against.
    pub base_version: i64,
    pub payload: Option<&'a Value>,
}

impl ConflictSide<'_> {
    fn state(&self) -> Option<&Value> {
        match self.operation {
            Operation::Delete => None,
            _ => self.payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionKind {
    /// Both sides already agree.
    Converged,
    /// Concurrent changes from the same base, replayed together.
    Replayed,
    /// Divergent changes merged with the entity type's strategy.
    Merged,
    RemoteWins,
    DeleteWins,
}

impl ResolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionKind::Converged => "converged",
            ResolutionKind::Replayed => "replayed",
            ResolutionKind::Merged => "merged",
            ResolutionKind::RemoteWins => "remote_wins",
            ResolutionKind::DeleteWins => "delete_wins",
        }
    }
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub kind: ResolutionKind,
    /// Final entity state; `None` means deleted.
    pub state: Option<Value>,
    /// The final state differs from the remote's and must be sent.
    pub push: bool,
    /// Write an audit record for this resolution.
    pub audit: bool,
}

impl Resolution {
    /// The local change lost and should be marked conflicted.
    pub fn local_rejected(&self) -> bool {
        !self.push && matches!(self.kind, ResolutionKind::RemoteWins | ResolutionKind::DeleteWins)
    }
}

// ---------------------------------------------------------------------------
// Merge strategies
// ---------------------------------------------------------------------------

/// Per-entity-type merge rules.
pub trait MergeStrategy: Send + Sync {
    /// Whether concurrent numeric changes to `field` are deltas to be added
    /// together, like a stock quantity.
    fn is_additive(&self, field: &str) -> bool;
}

/// Strategy with a fixed set of additive fields.
#[derive(Debug, Clone, Default)]
pub struct AdditiveFields {
    fields: HashSet<String>,
}

impl AdditiveFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl MergeStrategy for AdditiveFields {
    fn is_additive(&self, field: &str) -> bool {
        self.fields.contains(field)
    }
}

/// Merge strategies keyed by entity type.
#[derive(Clone, Default)]
pub struct MergeRegistry {
    strategies: HashMap<String, Arc<dyn MergeStrategy>>,
}

impl MergeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: impl Into<String>, strategy: Arc<dyn MergeStrategy>) {
        self.strategies.insert(entity_type.into(), strategy);
    }

    pub fn with(mut self, entity_type: impl Into<String>, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.register(entity_type, strategy);
        self
    }

    pub fn get(&self, entity_type: &str) -> Option<&dyn MergeStrategy> {
        self.strategies.get(entity_type).map(|s| s.as_ref())
    }
}

impl fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeRegistry")
            .field("entity_types", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

pub fn resolve(
    local: &ConflictSide<'_>,
    remote: &ConflictSide<'_>,
    ancestor: Option<&Value>,
    strategy: Option<&dyn MergeStrategy>,
) -> Resolution {
    let (l, r) = match (local.state(), remote.state()) {
        (None, None) => {
            return Resolution {
                kind: ResolutionKind::Converged,
                state: None,
                push: false,
                audit: false,
            }
        }
        (None, Some(_)) => {
            return Resolution {
                kind: ResolutionKind::DeleteWins,
                state: None,
                push: true,
                audit: true,
            }
        }
        (Some(_), None) => {
            return Resolution {
                kind: ResolutionKind::DeleteWins,
                state: None,
                push: false,
                audit: true,
            }
        }
        (Some(l), Some(r)) => (l, r),
    };

    if l == r {
        return Resolution {
            kind: ResolutionKind::Converged,
            state: Some(r.clone()),
            push: false,
            audit: false,
        };
    }

    if local.base_version == remote.base_version {
        let state = replay(ancestor, l, r, strategy);
        let push = &state != r;
        return Resolution {
            kind: ResolutionKind::Replayed,
            state: Some(state),
            push,
            audit: false,
        };
    }

    match strategy {
        Some(strategy) => {
            let merged = merge_additive(ancestor, l, r, strategy);
            let push = &merged != r;
            Resolution {
                kind: if push {
                    ResolutionKind::Merged
                } else {
                    ResolutionKind::RemoteWins
                },
                state: Some(merged),
                push,
                audit: true,
            }
        }
        None => Resolution {
            kind: ResolutionKind::RemoteWins,
            state: Some(r.clone()),
            push: false,
            audit: true,
        },
    }
}

fn as_object(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value.and_then(Value::as_object)
}

/// Three-way field replay of two concurrent changes on a common ancestor.
fn replay(
    ancestor: Option<&Value>,
    local: &Value,
    remote: &Value,
    strategy: Option<&dyn MergeStrategy>,
) -> Value {
    let (Some(l), Some(r)) = (local.as_object(), remote.as_object()) else {
        return max_canonical(Some(local), Some(remote))
            .cloned()
            .unwrap_or(Value::Null);
    };
    let a = as_object(ancestor);

    let fields: BTreeSet<&String> = l
        .keys()
        .chain(r.keys())
        .chain(a.into_iter().flat_map(|m| m.keys()))
        .collect();

    let mut out = Map::new();
    for field in fields {
        let lv = l.get(field);
        let rv = r.get(field);
        let av = a.and_then(|m| m.get(field));

        let value = if lv == rv {
            lv.cloned()
        } else if lv == av {
            rv.cloned()
        } else if rv == av {
            lv.cloned()
        } else if strategy.is_some_and(|s| s.is_additive(field)) {
            add_deltas(av, lv, rv).or_else(|| max_canonical(lv, rv).cloned())
        } else {
            max_canonical(lv, rv).cloned()
        };

        if let Some(value) = value {
            out.insert(field.clone(), value);
        }
    }
    Value::Object(out)
}

/// Remote state with the local delta of each additive field added on top.
fn merge_additive(
    ancestor: Option<&Value>,
    local: &Value,
    remote: &Value,
    strategy: &dyn MergeStrategy,
) -> Value {
    let (Some(l), Some(r)) = (local.as_object(), remote.as_object()) else {
        return remote.clone();
    };
    let a = as_object(ancestor);

    let mut out = r.clone();
    for (field, lv) in l {
        if !strategy.is_additive(field) {
            continue;
        }
        let av = a.and_then(|m| m.get(field));
        let rv = r.get(field).or(av);
        if let Some(sum) = add_deltas(av, Some(lv), rv) {
            out.insert(field.clone(), sum);
        }
    }
    Value::Object(out)
}

/// `local + remote - ancestor`, treating a missing ancestor as zero. `None`
/// when any present value is not a number.
fn add_deltas(ancestor: Option<&Value>, local: Option<&Value>, remote: Option<&Value>) -> Option<Value> {
    fn num(v: Option<&Value>) -> Option<Option<&Value>> {
        match v {
            None => Some(None),
            Some(v) if v.is_number() => Some(Some(v)),
            Some(_) => None,
        }
    }
    let (a, l, r) = (num(ancestor)?, num(local)?, num(remote)?);

    let all_int = [a, l, r]
        .iter()
        .all(|v| v.map_or(true, |v| v.is_i64()));
    if all_int {
        let get = |v: Option<&Value>| v.and_then(Value::as_i64).unwrap_or(0);
        let sum = get(l)
            .checked_add(get(r))
            .and_then(|s| s.checked_sub(get(a)))?;
        return Some(Value::from(sum));
    }

    let get = |v: Option<&Value>| v.and_then(Value::as_f64).unwrap_or(0.0);
    serde_json::Number::from_f64(get(l) + get(r) - get(a)).map(Value::Number)
}

/// Role-independent tie-break: the greater value in canonical JSON text.
/// A present value beats an absent one.
fn max_canonical<'a>(a: Option<&'a Value>, b: Option<&'a Value>) -> Option<&'a Value> {
    match (a, b) {
        (Some(x), Some(y)) => {
            let xs = serde_json::to_string(x).unwrap_or_default();
            let ys = serde_json::to_string(y).unwrap_or_default();
            if xs >= ys {
                Some(x)
            } else {
                Some(y)
            }
        }
        (x, None) => x,
        (None, y) => y,
    }
}
