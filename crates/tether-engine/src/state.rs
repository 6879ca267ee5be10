//! Server-side mirror of the shared application state, one document per
//! thread. Every accepted mutation yields the RFC 6902 delta that takes the
//! previous document to the new one.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tether_core::ids::ThreadId;
use tracing::debug;

/// A requested mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// Changed top-level keys; the delta is computed by diffing.
    Merge(Map<String, Value>),
    /// Already-formed `add`/`remove`/`replace` operations, applied and
    /// forwarded verbatim.
    Patch(Vec<Value>),
}

/// Ordered patch operations describing one state change.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct StateDelta(Vec<Value>);

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn operations(&self) -> &[Value] {
        &self.0
    }

    pub fn into_operations(self) -> Vec<Value> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("operation {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("operation {index} has no \"op\"")]
    MissingOp { index: usize },
    #[error("operation {index} has no \"path\"")]
    MissingPath { index: usize },
    #[error("operation {index} uses unsupported op \"{op}\" (expected add, remove or replace)")]
    UnsupportedOp { index: usize, op: String },
    #[error("operation {index} ({op}) has no \"value\"")]
    MissingValue { index: usize, op: String },
    #[error("patch could not be applied: {0}")]
    Apply(String),
    #[error("the state change could not be delivered to the client")]
    Undelivered,
}

/// Reject the whole batch if any operation is malformed.
pub fn validate_operations(operations: &[Value]) -> Result<(), StateError> {
    for (index, operation) in operations.iter().enumerate() {
        let object = operation
            .as_object()
            .ok_or(StateError::NotAnObject { index })?;
        let op = object
            .get("op")
            .and_then(Value::as_str)
            .ok_or(StateError::MissingOp { index })?;
        object
            .get("path")
            .and_then(Value::as_str)
            .ok_or(StateError::MissingPath { index })?;
        match op {
            "add" | "replace" => {
                if !object.contains_key("value") {
                    return Err(StateError::MissingValue {
                        index,
                        op: op.to_string(),
                    });
                }
            }
            "remove" => {}
            other => {
                return Err(StateError::UnsupportedOp {
                    index,
                    op: other.to_string(),
                })
            }
        }
    }
    Ok(())
}

#[derive(Default)]
pub struct StateReconciler {
    documents: DashMap<ThreadId, Value>,
}

impl StateReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the mirror from a client snapshot. Only the first snapshot for a
    /// thread is taken; later ones are ignored. Returns whether it was taken.
    pub fn seed(&self, thread_id: &ThreadId, snapshot: Value) -> bool {
        let mut seeded = false;
        self.documents.entry(thread_id.clone()).or_insert_with(|| {
            seeded = true;
            snapshot
        });
        seeded
    }

    pub fn snapshot(&self, thread_id: &ThreadId) -> Option<Value> {
        self.documents.get(thread_id).map(|doc| doc.value().clone())
    }

    pub fn contains(&self, thread_id: &ThreadId) -> bool {
        self.documents.contains_key(thread_id)
    }

    pub fn clear(&self, thread_id: &ThreadId) -> bool {
        self.documents.remove(thread_id).is_some()
    }

    /// Apply `update` to the thread's mirror. On error the mirror is left
    /// untouched. An empty delta means nothing changed.
    pub fn apply(&self, thread_id: &ThreadId, update: StateUpdate) -> Result<StateDelta, StateError> {
        self.apply_if(thread_id, update, |_| true)
    }

    /// Like [`apply`](Self::apply), but a non-empty delta is first handed to
    /// `publish` and the mirror only advances if it returns true. The
    /// thread's document stays locked meanwhile.
    pub fn apply_if(
        &self,
        thread_id: &ThreadId,
        update: StateUpdate,
        publish: impl FnOnce(&StateDelta) -> bool,
    ) -> Result<StateDelta, StateError> {
        let mut doc = self
            .documents
            .entry(thread_id.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        let current = doc.value_mut();

        let (next, delta) = match update {
            StateUpdate::Merge(changes) => {
                let mut next = match &*current {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                for (key, value) in changes {
                    next.insert(key, value);
                }
                let next = Value::Object(next);
                let patch = json_patch::diff(&*current, &next);
                let operations = patch
                    .0
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| StateError::Apply(e.to_string()))?;
                (next, StateDelta(operations))
            }
            StateUpdate::Patch(operations) => {
                validate_operations(&operations)?;
                let patch = json_patch::Patch(
                    operations
                        .iter()
                        .map(|op| serde_json::from_value(op.clone()))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| StateError::Apply(e.to_string()))?,
                );
                let mut next = current.clone();
                json_patch::patch(&mut next, &patch.0).map_err(|e| StateError::Apply(e.to_string()))?;
                (next, StateDelta(operations))
            }
        };

        if !delta.is_empty() {
            if !publish(&delta) {
                return Err(StateError::Undelivered);
            }
            *current = next;
            debug!(thread_id = %thread_id, operations = delta.len(), "state mirror updated");
        }
        Ok(delta)
    }
}
