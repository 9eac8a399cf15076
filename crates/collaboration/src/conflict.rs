/// Conflict detection for concurrently edited timelines
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{
    ConflictId, ConflictProposal, DetectorConfig, Operation, OperationId, OperationLog,
    Resolution, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Same element edited by two operations within the edit window
    SimultaneousEdit,

    /// Two inserted clips overlap on the same track
    ClipOverlap,

    /// A peer's version references history we do not have
    VersionMismatch,

    /// An operation came from a user whose role cannot edit
    PermissionDenied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictingOperation {
    pub id: OperationId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl From<&Operation> for ConflictingOperation {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            user_id: op.user_id.clone(),
            timestamp: op.timestamp,
        }
    }
}

/// Detected interference between operations.
///
/// Created by the detector and mutated only by the
/// [`ConflictResolver`](crate::ConflictResolver) that stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub involved_users: Vec<UserId>,
    pub affected_elements: Vec<String>,
    pub operations: Vec<ConflictingOperation>,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
    pub proposals: Vec<ConflictProposal>,
}

impl Conflict {
    pub fn new(
        conflict_type: ConflictType,
        operations: &[&Operation],
        affected_elements: Vec<String>,
    ) -> Self {
        let mut involved_users: Vec<UserId> = Vec::new();
        for op in operations {
            if !involved_users.contains(&op.user_id) {
                involved_users.push(op.user_id.clone());
            }
        }

        Self {
            id: ConflictId::new(),
            conflict_type,
            involved_users,
            affected_elements,
            operations: operations.iter().map(|op| ConflictingOperation::from(*op)).collect(),
            detected_at: Utc::now(),
            resolved: false,
            resolution: None,
            proposals: Vec::new(),
        }
    }

    pub fn permission_denied(op: &Operation) -> Self {
        Self::new(
            ConflictType::PermissionDenied,
            &[op],
            vec![op.target.id.clone()],
        )
    }

    pub fn version_mismatch(user_id: UserId, version: String, missing_parent: String) -> Self {
        let mut conflict = Self::new(ConflictType::VersionMismatch, &[], vec![version, missing_parent]);
        conflict.involved_users.push(user_id);
        conflict
    }

    pub fn involves_operation(&self, id: &OperationId) -> bool {
        self.operations.iter().any(|op| &op.id == id)
    }
}

/// Pairwise conflict rules plus the bookkeeping of which pairs were checked.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    config: DetectorConfig,
    checked: HashSet<(OperationId, OperationId)>,
}

impl ConflictDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            checked: HashSet::new(),
        }
    }

    /// Checks one pair. Rules apply in order and the first match wins.
    pub fn detect(&self, a: &Operation, b: &Operation) -> Option<Conflict> {
        if a.target.id == b.target.id {
            let delta = (a.timestamp - b.timestamp).num_milliseconds().abs();
            if delta < self.config.simultaneous_edit_window_ms {
                return Some(Conflict::new(
                    ConflictType::SimultaneousEdit,
                    &[a, b],
                    vec![a.target.id.clone()],
                ));
            }
        }

        let (first, second) = (a.inserted_clip()?, b.inserted_clip()?);
        if first.track_id == second.track_id && first.clip.range().overlaps(&second.clip.range()) {
            return Some(Conflict::new(
                ConflictType::ClipOverlap,
                &[a, b],
                vec![first.clip.id.to_string(), second.clip.id.to_string()],
            ));
        }

        None
    }

    /// Checks every not-yet-checked pair from the detection window.
    ///
    /// The window holds every unapplied operation plus the most recently
    /// applied ones. Pairs where neither side is pending, or where one side
    /// descends from the other through its dependencies, are skipped.
    pub fn scan(&mut self, log: &OperationLog) -> Vec<Conflict> {
        let mut candidates: Vec<&Operation> = log.recently_applied(self.config.detection_window);
        candidates.extend(log.pending());

        let mut conflicts = Vec::new();
        for (i, a) in candidates.iter().enumerate() {
            for b in &candidates[i + 1..] {
                if log.is_applied(&a.id) && log.is_applied(&b.id) {
                    continue;
                }
                if a.id == b.id || log.causally_related(a, b) {
                    continue;
                }
                if !self.checked.insert(pair_key(&a.id, &b.id)) {
                    continue;
                }
                if let Some(conflict) = self.detect(a, b) {
                    conflicts.push(conflict);
                }
            }
        }
        conflicts
    }

    pub fn reset(&mut self) {
        self.checked.clear();
    }
}

fn pair_key(a: &OperationId, b: &OperationId) -> (OperationId, OperationId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}
