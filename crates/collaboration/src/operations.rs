/// Timeline operations and the append-only operation log
/// Operations are the unit replicated between collaborators
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use timeline::{Clip, ClipId, Time, Track, TrackId};

use crate::{CollaborationError, OperationId, Result, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Delete,
    Modify,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Clip,
    Track,
    Effect,
    Keyframe,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationTarget {
    #[serde(rename = "type")]
    pub kind: TargetType,
    pub id: String,
}

impl OperationTarget {
    pub fn clip(id: &ClipId) -> Self {
        Self {
            kind: TargetType::Clip,
            id: id.to_string(),
        }
    }

    pub fn track(id: &TrackId) -> Self {
        Self {
            kind: TargetType::Track,
            id: id.to_string(),
        }
    }
}

/// Timeline operation that is replicated across users.
///
/// Operations are immutable once created. Whether an operation has been
/// applied is tracked by the [`OperationLog`] that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub target: OperationTarget,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub dependencies: Vec<OperationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertClipPayload {
    pub track_id: TrackId,
    pub clip: Clip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertTrackPayload {
    pub track: Track,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyPayload {
    pub changes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePayload {
    pub track_id: TrackId,
    pub start_time: Time,
    pub end_time: Time,
}

impl Operation {
    pub fn new(
        op_type: OperationType,
        user_id: UserId,
        target: OperationTarget,
        payload: Value,
    ) -> Self {
        Self {
            id: OperationId::new(),
            op_type,
            user_id,
            timestamp: Utc::now(),
            target,
            payload,
            dependencies: Vec::new(),
        }
    }

    pub fn insert_clip(user_id: UserId, track_id: TrackId, clip: Clip) -> Self {
        let target = OperationTarget::clip(&clip.id);
        let payload = InsertClipPayload { track_id, clip };
        Self::new(OperationType::Insert, user_id, target, to_payload(&payload))
    }

    pub fn insert_track(user_id: UserId, track: Track) -> Self {
        let target = OperationTarget::track(&track.id);
        let payload = InsertTrackPayload { track };
        Self::new(OperationType::Insert, user_id, target, to_payload(&payload))
    }

    pub fn delete_clip(user_id: UserId, clip_id: &ClipId) -> Self {
        Self::new(
            OperationType::Delete,
            user_id,
            OperationTarget::clip(clip_id),
            Value::Null,
        )
    }

    pub fn delete_track(user_id: UserId, track_id: &TrackId) -> Self {
        Self::new(
            OperationType::Delete,
            user_id,
            OperationTarget::track(track_id),
            Value::Null,
        )
    }

    pub fn modify_clip(user_id: UserId, clip_id: &ClipId, changes: Map<String, Value>) -> Self {
        let payload = ModifyPayload { changes };
        Self::new(
            OperationType::Modify,
            user_id,
            OperationTarget::clip(clip_id),
            to_payload(&payload),
        )
    }

    pub fn move_clip(
        user_id: UserId,
        clip_id: &ClipId,
        track_id: TrackId,
        start_time: Time,
        end_time: Time,
    ) -> Self {
        let payload = MovePayload {
            track_id,
            start_time,
            end_time,
        };
        Self::new(
            OperationType::Move,
            user_id,
            OperationTarget::clip(clip_id),
            to_payload(&payload),
        )
    }

    pub fn with_dependencies(mut self, dependencies: Vec<OperationId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Decodes the payload into one of the typed payload shapes.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            CollaborationError::InvalidOp(format!(
                "malformed {:?} payload on operation {}: {}",
                self.op_type, self.id, e
            ))
        })
    }

    /// Payload of a clip insert, if this is one and it decodes.
    pub fn inserted_clip(&self) -> Option<InsertClipPayload> {
        if self.op_type != OperationType::Insert || self.target.kind != TargetType::Clip {
            return None;
        }
        self.payload_as().ok()
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Value {
    // Payload types are plain data with string keys; serialization cannot fail.
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Operation together with its applied marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub operation: Operation,
    pub applied: bool,
}

/// Append-only record of every operation seen for a project.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: Vec<LogEntry>,
    index: HashMap<OperationId, usize>,
    applied: HashSet<OperationId>,

    /// Applied operation ids in application order
    applied_order: Vec<OperationId>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from exported entries; applied entries are replayed in
    /// the order given.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        let mut log = Self::new();
        for entry in entries {
            let applied = entry.applied;
            let id = entry.operation.id.clone();
            if log.record(entry.operation) && applied {
                log.mark_applied(&id);
            }
        }
        log
    }

    /// Appends an operation unless one with the same id is already known.
    pub fn record(&mut self, op: Operation) -> bool {
        if self.index.contains_key(&op.id) {
            return false;
        }
        self.index.insert(op.id.clone(), self.entries.len());
        self.entries.push(LogEntry {
            operation: op,
            applied: false,
        });
        true
    }

    pub fn get(&self, id: &OperationId) -> Option<&LogEntry> {
        self.index.get(id).and_then(|&idx| self.entries.get(idx))
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.index.contains_key(id)
    }

    pub fn is_applied(&self, id: &OperationId) -> bool {
        self.applied.contains(id)
    }

    /// Flips the applied marker. Returns false if unknown or already applied.
    pub fn mark_applied(&mut self, id: &OperationId) -> bool {
        let Some(&idx) = self.index.get(id) else {
            return false;
        };
        if !self.applied.insert(id.clone()) {
            return false;
        }
        self.entries[idx].applied = true;
        self.applied_order.push(id.clone());
        true
    }

    pub fn unsatisfied_dependencies(&self, op: &Operation) -> Vec<OperationId> {
        op.dependencies
            .iter()
            .filter(|dep| !self.applied.contains(*dep))
            .cloned()
            .collect()
    }

    /// Whether `ancestor` is reachable from `op` through recorded
    /// dependencies.
    pub fn is_ancestor(&self, ancestor: &OperationId, op: &Operation) -> bool {
        let mut stack: Vec<&OperationId> = op.dependencies.iter().collect();
        let mut visited = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == ancestor {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(entry) = self.get(id) {
                stack.extend(entry.operation.dependencies.iter());
            }
        }
        false
    }

    /// Either operation causally precedes the other.
    pub fn causally_related(&self, a: &Operation, b: &Operation) -> bool {
        self.is_ancestor(&a.id, b) || self.is_ancestor(&b.id, a)
    }

    /// Operations recorded but not applied yet, in log order.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.entries
            .iter()
            .filter(|e| !e.applied)
            .map(|e| &e.operation)
    }

    /// Applied operations in the order they were applied.
    pub fn applied(&self) -> impl Iterator<Item = &Operation> {
        self.applied_order
            .iter()
            .filter_map(|id| self.get(id))
            .map(|e| &e.operation)
    }

    /// Entries with applied operations first, in application order,
    /// followed by pending ones in log order. `from_entries` on this
    /// sequence rebuilds the same application order.
    pub fn history(&self) -> Vec<LogEntry> {
        self.applied_order
            .iter()
            .filter_map(|id| self.get(id))
            .chain(self.entries.iter().filter(|e| !e.applied))
            .cloned()
            .collect()
    }

    /// The last `n` applied operations, oldest first.
    pub fn recently_applied(&self, n: usize) -> Vec<&Operation> {
        let start = self.applied_order.len().saturating_sub(n);
        self.applied_order[start..]
            .iter()
            .filter_map(|id| self.get(id))
            .map(|e| &e.operation)
            .collect()
    }

    /// Most recently applied operation on the given target.
    pub fn last_touching(&self, target_id: &str) -> Option<&OperationId> {
        self.applied_order.iter().rev().find(|id| {
            self.get(id)
                .map(|e| e.operation.target.id == target_id)
                .unwrap_or(false)
        })
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len() - self.applied.len()
    }
}
