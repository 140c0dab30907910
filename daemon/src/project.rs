//! Project manifest: the daemon's view of the external Project Store.
//!
//! Projects are provisioned by the platform; the daemon only reads them.
//! The manifest lives at `<data_dir>/projects.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use overture_events::AgentKind;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::Result;

/// One project as the platform provisioned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: String,
    /// Absolute path to the project workspace. Owned by the adapter
    /// subprocess during a run; the daemon never writes into it.
    pub workspace: PathBuf,
    #[serde(default)]
    pub preferred_agent: Option<AgentKind>,
    #[serde(default)]
    pub preferred_model: Option<String>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, project_id: &str) -> Option<ProjectInfo>;
    async fn list(&self) -> Vec<ProjectInfo>;
}

/// projects.json format
#[derive(Debug, Deserialize)]
struct ProjectsManifest {
    projects: Vec<ProjectInfo>,
}

/// Manifest-backed project store.
pub struct ManifestProjectStore {
    projects: RwLock<HashMap<String, ProjectInfo>>,
}

impl ManifestProjectStore {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("projects.json");
        if !path.exists() {
            return Ok(Self::from_projects(Vec::new()));
        }

        let content = std::fs::read_to_string(&path)?;
        let manifest: ProjectsManifest = serde_json::from_str(&content)?;

        for project in &manifest.projects {
            if !project.workspace.exists() {
                warn!(
                    project = %project.id,
                    workspace = %project.workspace.display(),
                    "project workspace does not exist"
                );
            }
        }

        Ok(Self::from_projects(manifest.projects))
    }

    pub fn from_projects(projects: Vec<ProjectInfo>) -> Self {
        let map = projects.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            projects: RwLock::new(map),
        }
    }

    pub async fn insert(&self, project: ProjectInfo) {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project);
    }
}

#[async_trait]
impl ProjectStore for ManifestProjectStore {
    async fn get(&self, project_id: &str) -> Option<ProjectInfo> {
        self.projects.read().await.get(project_id).cloned()
    }

    async fn list(&self) -> Vec<ProjectInfo> {
        self.projects.read().await.values().cloned().collect()
    }
}
