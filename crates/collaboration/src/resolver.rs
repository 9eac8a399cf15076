/// Conflict storage, resolution strategies and proposal voting
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{Conflict, ConflictId, CollaborationError, ProposalId, Result, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Merge,
    Overwrite,
    Manual,
    Revert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: StrategyKind,
    pub resolved_by: UserId,
    pub resolved_at: DateTime<Utc>,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalVote {
    pub user_id: UserId,
    pub vote: Vote,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictProposal {
    pub id: ProposalId,
    pub user_id: UserId,
    pub strategy: StrategyKind,
    pub changes: Value,
    pub votes: Vec<ProposalVote>,
    pub created_at: DateTime<Utc>,
}

impl ConflictProposal {
    /// Returns `(approvals, rejections)`.
    pub fn tally(&self) -> (usize, usize) {
        let approvals = self.votes.iter().filter(|v| v.vote == Vote::Approve).count();
        (approvals, self.votes.len() - approvals)
    }

    fn cast(&mut self, user_id: UserId, vote: Vote) {
        self.votes.retain(|v| v.user_id != user_id);
        self.votes.push(ProposalVote {
            user_id,
            vote,
            timestamp: Utc::now(),
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    Resolved { notes: String },

    /// Left for a human to decide
    Deferred,
}

/// A pluggable way of closing a conflict.
pub trait ResolutionStrategy: Send + Sync {
    fn resolve(&self, conflict: &Conflict, user_id: &UserId) -> StrategyOutcome;
}

struct MergeStrategy;

impl ResolutionStrategy for MergeStrategy {
    fn resolve(&self, conflict: &Conflict, _user_id: &UserId) -> StrategyOutcome {
        StrategyOutcome::Resolved {
            notes: format!(
                "kept changes from {} operations on {}",
                conflict.operations.len(),
                conflict.affected_elements.join(", ")
            ),
        }
    }
}

struct OverwriteStrategy;

impl ResolutionStrategy for OverwriteStrategy {
    fn resolve(&self, conflict: &Conflict, _user_id: &UserId) -> StrategyOutcome {
        let notes = match conflict.operations.iter().max_by_key(|op| op.timestamp) {
            Some(latest) => format!("kept operation {} by {}", latest.id, latest.user_id),
            None => "nothing to overwrite".to_string(),
        };
        StrategyOutcome::Resolved { notes }
    }
}

struct ManualStrategy;

impl ResolutionStrategy for ManualStrategy {
    fn resolve(&self, _conflict: &Conflict, _user_id: &UserId) -> StrategyOutcome {
        StrategyOutcome::Deferred
    }
}

struct RevertStrategy;

impl ResolutionStrategy for RevertStrategy {
    fn resolve(&self, conflict: &Conflict, _user_id: &UserId) -> StrategyOutcome {
        let ids: Vec<String> = conflict.operations.iter().map(|op| op.id.to_string()).collect();
        StrategyOutcome::Resolved {
            notes: format!("rolled back operations [{}]", ids.join(", ")),
        }
    }
}

/// Holds every conflict raised in the session.
///
/// Shared between the operation processor (which registers conflicts) and the
/// session (which resolves them and collects proposals).
pub struct ConflictResolver {
    conflicts: Mutex<Vec<Conflict>>,
    strategies: Mutex<HashMap<StrategyKind, Arc<dyn ResolutionStrategy>>>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        let mut strategies: HashMap<StrategyKind, Arc<dyn ResolutionStrategy>> = HashMap::new();
        strategies.insert(StrategyKind::Merge, Arc::new(MergeStrategy));
        strategies.insert(StrategyKind::Overwrite, Arc::new(OverwriteStrategy));
        strategies.insert(StrategyKind::Manual, Arc::new(ManualStrategy));
        strategies.insert(StrategyKind::Revert, Arc::new(RevertStrategy));

        Self {
            conflicts: Mutex::new(Vec::new()),
            strategies: Mutex::new(strategies),
        }
    }

    /// Replaces the strategy used for `kind`.
    pub fn register_strategy(&self, kind: StrategyKind, strategy: Arc<dyn ResolutionStrategy>) {
        self.strategies.lock().insert(kind, strategy);
    }

    pub fn register(&self, conflict: Conflict) -> ConflictId {
        let id = conflict.id.clone();
        info!(
            conflict = %id,
            "conflict detected: {:?} on {:?}", conflict.conflict_type, conflict.affected_elements
        );
        self.conflicts.lock().push(conflict);
        id
    }

    pub fn get(&self, id: &ConflictId) -> Option<Conflict> {
        self.conflicts.lock().iter().find(|c| &c.id == id).cloned()
    }

    pub fn open_conflicts(&self) -> Vec<Conflict> {
        self.conflicts
            .lock()
            .iter()
            .filter(|c| !c.resolved)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Conflict> {
        self.conflicts.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.conflicts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.lock().is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.conflicts.lock().iter().filter(|c| !c.resolved).count()
    }

    /// Runs the named strategy against the conflict.
    ///
    /// Returns `Ok(true)` when the conflict was closed, `Ok(false)` when it
    /// was already resolved or the strategy deferred.
    pub fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        strategy: StrategyKind,
        user_id: &UserId,
    ) -> Result<bool> {
        let handler = self.strategies.lock().get(&strategy).cloned();

        let mut conflicts = self.conflicts.lock();
        let conflict = conflicts
            .iter_mut()
            .find(|c| &c.id == conflict_id)
            .ok_or_else(|| CollaborationError::ConflictNotFound(conflict_id.clone()))?;

        if conflict.resolved {
            return Ok(false);
        }

        let Some(handler) = handler else {
            debug!(conflict = %conflict_id, "no strategy registered for {:?}", strategy);
            return Ok(false);
        };

        match handler.resolve(conflict, user_id) {
            StrategyOutcome::Resolved { notes } => {
                conflict.resolved = true;
                conflict.resolution = Some(Resolution {
                    strategy,
                    resolved_by: user_id.clone(),
                    resolved_at: Utc::now(),
                    notes,
                });
                info!(conflict = %conflict_id, user = %user_id, "conflict resolved with {:?}", strategy);
                Ok(true)
            }
            StrategyOutcome::Deferred => {
                debug!(conflict = %conflict_id, "resolution deferred");
                Ok(false)
            }
        }
    }

    pub fn propose_resolution(
        &self,
        conflict_id: &ConflictId,
        user_id: UserId,
        strategy: StrategyKind,
        changes: Value,
    ) -> Result<ProposalId> {
        let mut conflicts = self.conflicts.lock();
        let conflict = conflicts
            .iter_mut()
            .find(|c| &c.id == conflict_id)
            .ok_or_else(|| CollaborationError::ConflictNotFound(conflict_id.clone()))?;

        let proposal = ConflictProposal {
            id: ProposalId::new(),
            user_id,
            strategy,
            changes,
            votes: Vec::new(),
            created_at: Utc::now(),
        };
        let id = proposal.id.clone();
        conflict.proposals.push(proposal);
        Ok(id)
    }

    /// Records a vote, replacing any earlier vote by the same user.
    pub fn vote_on_proposal(
        &self,
        conflict_id: &ConflictId,
        proposal_id: &ProposalId,
        user_id: UserId,
        vote: Vote,
    ) -> Result<()> {
        let mut conflicts = self.conflicts.lock();
        let conflict = conflicts
            .iter_mut()
            .find(|c| &c.id == conflict_id)
            .ok_or_else(|| CollaborationError::ConflictNotFound(conflict_id.clone()))?;

        let proposal = conflict
            .proposals
            .iter_mut()
            .find(|p| &p.id == proposal_id)
            .ok_or_else(|| CollaborationError::ProposalNotFound {
                conflict: conflict_id.clone(),
                proposal: proposal_id.clone(),
            })?;

        proposal.cast(user_id, vote);
        Ok(())
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("conflicts", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConflictType, Operation};
    use chrono::Duration;
    use serde_json::json;

    fn raise(resolver: &ConflictResolver) -> (ConflictId, Operation) {
        let early = Operation::delete_clip("u1".into(), &"c1".into())
            .with_timestamp(Utc::now() - Duration::milliseconds(300));
        let late = Operation::delete_clip("u2".into(), &"c1".into());
        let conflict = Conflict::new(
            ConflictType::SimultaneousEdit,
            &[&early, &late],
            vec!["c1".to_string()],
        );
        (resolver.register(conflict), late)
    }

    #[test]
    fn overwrite_names_latest_operation() {
        let resolver = ConflictResolver::new();
        let (id, late) = raise(&resolver);

        assert!(resolver
            .resolve_conflict(&id, StrategyKind::Overwrite, &"u1".into())
            .unwrap());

        let conflict = resolver.get(&id).unwrap();
        let resolution = conflict.resolution.unwrap();
        assert!(conflict.resolved);
        assert_eq!(resolution.strategy, StrategyKind::Overwrite);
        assert!(resolution.notes.contains(late.id.as_str()));

        // already closed
        assert!(!resolver
            .resolve_conflict(&id, StrategyKind::Merge, &"u1".into())
            .unwrap());
        assert_eq!(resolver.open_count(), 0);
    }

    #[test]
    fn manual_never_resolves() {
        let resolver = ConflictResolver::new();
        let (id, _) = raise(&resolver);

        assert!(!resolver
            .resolve_conflict(&id, StrategyKind::Manual, &"u1".into())
            .unwrap());
        assert_eq!(resolver.open_conflicts().len(), 1);
    }

    #[test]
    fn unknown_conflict_is_an_error() {
        let resolver = ConflictResolver::new();
        let err = resolver
            .resolve_conflict(&"missing".into(), StrategyKind::Merge, &"u1".into())
            .unwrap_err();
        assert!(matches!(err, CollaborationError::ConflictNotFound(_)));
    }

    #[test]
    fn revote_replaces_prior_vote() {
        let resolver = ConflictResolver::new();
        let (id, _) = raise(&resolver);
        let proposal = resolver
            .propose_resolution(&id, "u1".into(), StrategyKind::Revert, json!({ "keep": "c1" }))
            .unwrap();

        resolver
            .vote_on_proposal(&id, &proposal, "u2".into(), Vote::Approve)
            .unwrap();
        resolver
            .vote_on_proposal(&id, &proposal, "u3".into(), Vote::Approve)
            .unwrap();
        resolver
            .vote_on_proposal(&id, &proposal, "u2".into(), Vote::Reject)
            .unwrap();

        let conflict = resolver.get(&id).unwrap();
        assert_eq!(conflict.proposals[0].tally(), (1, 1));
        assert!(!conflict.resolved);

        let err = resolver
            .vote_on_proposal(&id, &"nope".into(), "u2".into(), Vote::Approve)
            .unwrap_err();
        assert!(matches!(err, CollaborationError::ProposalNotFound { .. }));
    }

    #[test]
    fn custom_strategy_replaces_builtin() {
        struct AlwaysDefer;
        impl ResolutionStrategy for AlwaysDefer {
            fn resolve(&self, _: &Conflict, _: &UserId) -> StrategyOutcome {
                StrategyOutcome::Deferred
            }
        }

        let resolver = ConflictResolver::new();
        resolver.register_strategy(StrategyKind::Merge, Arc::new(AlwaysDefer));
        let (id, _) = raise(&resolver);
        assert!(!resolver
            .resolve_conflict(&id, StrategyKind::Merge, &"u1".into())
            .unwrap());
    }
}
