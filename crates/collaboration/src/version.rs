/// Immutable project versions organised into named branches
///
/// Snapshots hold `Arc`s to the timeline and asset library, so a version shares
/// memory with the live state until the next edit copies it.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use timeline::{AssetLibrary, Clip, ClipId, TimelineState};
use tracing::info;

use crate::{CollaborationError, Result, UserId, VersionId};

pub const MAIN_BRANCH: &str = "main";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesSummary {
    pub added: Vec<ClipId>,
    pub modified: Vec<ClipId>,
    pub deleted: Vec<ClipId>,
}

impl ChangesSummary {
    /// Clip-level diff; lists are sorted by id.
    pub fn between(before: &TimelineState, after: &TimelineState) -> Self {
        let old: BTreeMap<&ClipId, &Clip> = before.clips().map(|c| (&c.id, c)).collect();
        let new: BTreeMap<&ClipId, &Clip> = after.clips().map(|c| (&c.id, c)).collect();

        let mut summary = Self::default();
        for (id, clip) in &new {
            match old.get(id) {
                None => summary.added.push((*id).clone()),
                Some(previous) if previous != clip => summary.modified.push((*id).clone()),
                Some(_) => {}
            }
        }
        summary.deleted = old
            .keys()
            .filter(|id| !new.contains_key(*id))
            .map(|id| (*id).clone())
            .collect();
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectVersion {
    pub id: VersionId,
    pub name: String,
    pub description: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub timeline: Arc<TimelineState>,
    pub assets: Arc<AssetLibrary>,
    pub changes_summary: ChangesSummary,
    pub parent_version: Option<VersionId>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Serializable form of [`VersionControl`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionHistory {
    pub versions: Vec<ProjectVersion>,
    pub branches: BTreeMap<String, Vec<VersionId>>,
    pub current_branch: String,
}

#[derive(Debug, Clone)]
pub struct VersionControl {
    versions: HashMap<VersionId, ProjectVersion>,
    branches: BTreeMap<String, Vec<VersionId>>,
    current_branch: String,
}

impl Default for VersionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionControl {
    pub fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(MAIN_BRANCH.to_string(), Vec::new());
        Self {
            versions: HashMap::new(),
            branches,
            current_branch: MAIN_BRANCH.to_string(),
        }
    }

    /// Snapshots the state onto the current branch.
    ///
    /// The change summary is computed against `parent`, or against an empty
    /// timeline when there is none.
    pub fn create_version(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        created_by: UserId,
        timeline: Arc<TimelineState>,
        assets: Arc<AssetLibrary>,
        parent: Option<&VersionId>,
    ) -> Result<ProjectVersion> {
        let changes_summary = match parent {
            Some(parent_id) => {
                let parent = self
                    .versions
                    .get(parent_id)
                    .ok_or_else(|| CollaborationError::VersionNotFound(parent_id.clone()))?;
                ChangesSummary::between(&parent.timeline, &timeline)
            }
            None => ChangesSummary::between(&TimelineState::default(), &timeline),
        };

        let version = ProjectVersion {
            id: VersionId::new(),
            name: name.into(),
            description: description.into(),
            created_by,
            created_at: Utc::now(),
            timeline,
            assets,
            changes_summary,
            parent_version: parent.cloned(),
            tags: Vec::new(),
        };

        let branch = self.current_branch.clone();
        self.insert(&branch, version.clone());
        info!(version = %version.id, branch = %branch, "created version {:?}", version.name);
        Ok(version)
    }

    /// [`create_version`](Self::create_version) parented on the current branch tip.
    pub fn commit(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        created_by: UserId,
        timeline: Arc<TimelineState>,
        assets: Arc<AssetLibrary>,
    ) -> Result<ProjectVersion> {
        let parent = self.latest(&self.current_branch).map(|v| v.id.clone());
        self.create_version(name, description, created_by, timeline, assets, parent.as_ref())
    }

    /// Creates a branch. An existing name is left alone and yields `Ok(false)`.
    pub fn create_branch(&mut self, name: &str, from: Option<&VersionId>) -> Result<bool> {
        if self.branches.contains_key(name) {
            return Ok(false);
        }
        let seed = match from {
            Some(id) if !self.versions.contains_key(id) => {
                return Err(CollaborationError::VersionNotFound(id.clone()))
            }
            Some(id) => vec![id.clone()],
            None => Vec::new(),
        };
        self.branches.insert(name.to_string(), seed);
        Ok(true)
    }

    pub fn switch_branch(&mut self, name: &str) -> Result<()> {
        if !self.branches.contains_key(name) {
            return Err(CollaborationError::BranchNotFound(name.to_string()));
        }
        self.current_branch = name.to_string();
        Ok(())
    }

    /// Copies the tip of `source` onto `target` as a new version.
    ///
    /// The result takes the source's timeline and assets wholesale; nothing
    /// from the target tip is kept. Returns `None` when either tip is missing.
    pub fn merge_branch(
        &mut self,
        source: &str,
        target: &str,
        user_id: UserId,
    ) -> Option<ProjectVersion> {
        let source_tip = self.latest(source)?.clone();
        let target_tip = self.latest(target)?.clone();

        let version = ProjectVersion {
            id: VersionId::new(),
            name: format!("Merge {} into {}", source, target),
            description: format!("Merged {} ({})", source, source_tip.name),
            created_by: user_id,
            created_at: Utc::now(),
            changes_summary: ChangesSummary::between(&target_tip.timeline, &source_tip.timeline),
            timeline: source_tip.timeline.clone(),
            assets: source_tip.assets.clone(),
            parent_version: Some(target_tip.id.clone()),
            tags: vec!["merge".to_string(), source.to_string(), target.to_string()],
        };

        self.insert(target, version.clone());
        info!(version = %version.id, "merged branch {} into {}", source, target);
        Some(version)
    }

    /// Adopts a version created by a peer.
    ///
    /// Returns `Ok(false)` if it is already known. A parent we have never seen
    /// means our histories diverged and fails with `VersionMismatch`.
    pub fn record_remote(&mut self, branch: &str, version: ProjectVersion) -> Result<bool> {
        if self.versions.contains_key(&version.id) {
            return Ok(false);
        }
        if let Some(parent) = &version.parent_version {
            if !self.versions.contains_key(parent) {
                return Err(CollaborationError::VersionMismatch(format!(
                    "version {} references unknown parent {}",
                    version.id, parent
                )));
            }
        }
        self.insert(branch, version);
        Ok(true)
    }

    fn insert(&mut self, branch: &str, version: ProjectVersion) {
        self.branches
            .entry(branch.to_string())
            .or_default()
            .push(version.id.clone());
        self.versions.insert(version.id.clone(), version);
    }

    pub fn get(&self, id: &VersionId) -> Option<&ProjectVersion> {
        self.versions.get(id)
    }

    /// Versions on the branch, oldest first. Unknown branches are empty.
    pub fn history(&self, branch: &str) -> Vec<&ProjectVersion> {
        self.branches
            .get(branch)
            .map(|ids| ids.iter().filter_map(|id| self.versions.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, branch: &str) -> Option<&ProjectVersion> {
        self.branches
            .get(branch)?
            .last()
            .and_then(|id| self.versions.get(id))
    }

    pub fn branches(&self) -> Vec<&str> {
        self.branches.keys().map(String::as_str).collect()
    }

    pub fn current_branch(&self) -> &str {
        &self.current_branch
    }

    pub fn diff(&self, from: &VersionId, to: &VersionId) -> Result<ChangesSummary> {
        let a = self
            .get(from)
            .ok_or_else(|| CollaborationError::VersionNotFound(from.clone()))?;
        let b = self
            .get(to)
            .ok_or_else(|| CollaborationError::VersionNotFound(to.clone()))?;
        Ok(ChangesSummary::between(&a.timeline, &b.timeline))
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn to_history(&self) -> VersionHistory {
        let mut versions: Vec<ProjectVersion> = self.versions.values().cloned().collect();
        versions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        VersionHistory {
            versions,
            branches: self.branches.clone(),
            current_branch: self.current_branch.clone(),
        }
    }

    /// Rebuilds from a history, checking that every branch entry exists.
    pub fn from_history(history: VersionHistory) -> Result<Self> {
        let versions: HashMap<VersionId, ProjectVersion> = history
            .versions
            .into_iter()
            .map(|v| (v.id.clone(), v))
            .collect();

        for ids in history.branches.values() {
            if let Some(missing) = ids.iter().find(|id| !versions.contains_key(*id)) {
                return Err(CollaborationError::VersionNotFound(missing.clone()));
            }
        }

        let mut branches = history.branches;
        branches.entry(MAIN_BRANCH.to_string()).or_default();
        let current_branch = if branches.contains_key(&history.current_branch) {
            history.current_branch
        } else {
            MAIN_BRANCH.to_string()
        };

        Ok(Self {
            versions,
            branches,
            current_branch,
        })
    }
}
