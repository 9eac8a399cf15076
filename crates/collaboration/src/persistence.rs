/// Project persistence and export
/// Snapshots are stored as pretty JSON, one file per project
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use timeline::{AssetLibrary, TimelineState};
use tokio::fs;

use crate::{
    Comment, CollaborationError, LogEntry, ProjectId, Result, VersionControl, VersionHistory,
};

pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub timeline: TimelineState,
    #[serde(default)]
    pub assets: AssetLibrary,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl ProjectRecord {
    pub fn empty(id: ProjectId) -> Self {
        Self {
            id,
            timeline: TimelineState::default(),
            assets: AssetLibrary::new(),
            comments: Vec::new(),
        }
    }
}

/// Everything a store round-trips for one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub project: ProjectRecord,
    pub versions: VersionHistory,
}

impl ProjectSnapshot {
    pub fn new(project: ProjectRecord) -> Self {
        Self {
            project,
            versions: VersionControl::new().to_history(),
        }
    }
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn load_project(&self, project_id: &ProjectId) -> Result<Option<ProjectSnapshot>>;

    async fn save_project(&self, snapshot: &ProjectSnapshot) -> Result<()>;
}

/// Stores snapshots under a directory
pub struct JsonFileStore {
    storage_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, project_id: &ProjectId) -> PathBuf {
        self.storage_dir
            .join(format!("project_{}.json", project_id))
    }
}

#[async_trait]
impl ProjectStore for JsonFileStore {
    async fn load_project(&self, project_id: &ProjectId) -> Result<Option<ProjectSnapshot>> {
        let filepath = self.path_for(project_id);
        if !fs::try_exists(&filepath)
            .await
            .map_err(|e| CollaborationError::Storage(format!("Failed to stat {}: {}", filepath.display(), e)))?
        {
            return Ok(None);
        }

        let json = fs::read_to_string(&filepath)
            .await
            .map_err(|e| CollaborationError::Storage(format!("Failed to read project from disk: {}", e)))?;

        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn save_project(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|e| CollaborationError::Storage(format!("Failed to create storage directory: {}", e)))?;

        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(self.path_for(&snapshot.project.id), json)
            .await
            .map_err(|e| CollaborationError::Storage(format!("Failed to write project to disk: {}", e)))?;

        Ok(())
    }
}

/// Keeps snapshots in memory; useful for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    projects: Mutex<HashMap<ProjectId, ProjectSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.projects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.lock().is_empty()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn load_project(&self, project_id: &ProjectId) -> Result<Option<ProjectSnapshot>> {
        Ok(self.projects.lock().get(project_id).cloned())
    }

    async fn save_project(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        self.projects
            .lock()
            .insert(snapshot.project.id.clone(), snapshot.clone());
        Ok(())
    }
}

/// Self-contained backup of a project including its operation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectExport {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub project: ProjectRecord,
    pub version_history: VersionHistory,
    pub operation_history: Vec<LogEntry>,
}

impl ProjectExport {
    pub fn new(
        project: ProjectRecord,
        version_history: VersionHistory,
        operation_history: Vec<LogEntry>,
    ) -> Self {
        Self {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            project,
            version_history,
            operation_history,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let export: Self = serde_json::from_str(json)?;
        if export.format_version != EXPORT_FORMAT_VERSION {
            return Err(CollaborationError::SerializationError(format!(
                "unsupported export format version {}",
                export.format_version
            )));
        }
        Ok(export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timeline::{Track, TrackKind};

    fn snapshot(id: &str) -> ProjectSnapshot {
        let mut project = ProjectRecord::empty(id.into());
        project.timeline.tracks.push(Track::new("t1", TrackKind::Audio, 0));
        ProjectSnapshot::new(project)
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("collab-store-{}", uuid::Uuid::new_v4()));
        let store = JsonFileStore::new(&dir);
        let project_id = ProjectId::from("p1");

        assert!(store.load_project(&project_id).await.unwrap().is_none());

        let saved = snapshot("p1");
        store.save_project(&saved).await.unwrap();
        let loaded = store.load_project(&project_id).await.unwrap().unwrap();
        assert_eq!(loaded, saved);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.save_project(&snapshot("p2")).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.load_project(&"p2".into()).await.unwrap().is_some());
        assert!(store.load_project(&"p3".into()).await.unwrap().is_none());
    }

    #[test]
    fn export_rejects_unknown_format() {
        let snap = snapshot("p1");
        let mut export = ProjectExport::new(snap.project, snap.versions, Vec::new());
        export.format_version = 99;
        let json = serde_json::to_string(&export).unwrap();
        assert!(matches!(
            ProjectExport::from_json(&json),
            Err(CollaborationError::SerializationError(_))
        ));
    }
}
