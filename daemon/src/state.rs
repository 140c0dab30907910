//! Daemon-wide shared state: registry, stores, and the live
//! orchestrator table with locate-or-create semantics.

use std::collections::HashMap;
use std::sync::Arc;

use overture_events::MessageStore;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::Config;
use crate::error::{DaemonError, Result};
use crate::orchestrator::{Orchestrator, OrchestratorDeps, OrchestratorHandle};
use crate::project::ProjectStore;
use crate::prompt::PromptLoader;
use crate::registry::AdapterRegistry;

pub struct DaemonState {
    pub config: Config,
    /// Token for authentication (None if auth disabled)
    pub token: Option<String>,
    pub registry: Arc<AdapterRegistry>,
    pub messages: Arc<dyn MessageStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub prompts: Arc<PromptLoader>,
    orchestrators: Arc<RwLock<HashMap<String, OrchestratorHandle>>>,
}

impl DaemonState {
    pub fn new(
        config: Config,
        token: Option<String>,
        registry: Arc<AdapterRegistry>,
        messages: Arc<dyn MessageStore>,
        projects: Arc<dyn ProjectStore>,
        prompts: Arc<PromptLoader>,
    ) -> Self {
        Self {
            config,
            token,
            registry,
            messages,
            projects,
            prompts,
            orchestrators: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Locate the project's orchestrator, spawning one if none is alive.
    /// Idle orchestrators retire themselves; dead handles are replaced
    /// on the next call.
    pub async fn orchestrator(&self, project_id: &str) -> Result<OrchestratorHandle> {
        let project = self
            .projects
            .get(project_id)
            .await
            .ok_or_else(|| DaemonError::ProjectUnknown(project_id.to_string()))?;

        {
            let map = self.orchestrators.read().await;
            if let Some(handle) = map.get(project_id) {
                if !handle.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        let mut map = self.orchestrators.write().await;
        if let Some(handle) = map.get(project_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        debug!(project = %project_id, "spawning orchestrator");
        let deps = OrchestratorDeps {
            config: self.config.clone(),
            registry: self.registry.clone(),
            store: self.messages.clone(),
            prompts: self.prompts.clone(),
        };
        let (handle, task) = Orchestrator::spawn(project, deps);
        map.insert(project_id.to_string(), handle.clone());

        // Reap the table entry once the orchestrator retires, unless a
        // newer handle already replaced it.
        let table = self.orchestrators.clone();
        let key = project_id.to_string();
        tokio::spawn(async move {
            let _ = task.await;
            let mut map = table.write().await;
            if map.get(&key).is_some_and(|h| h.is_closed()) {
                map.remove(&key);
            }
        });

        Ok(handle)
    }

    /// Cancel in-flight work and stop every orchestrator.
    pub async fn shutdown(&self) {
        let map = self.orchestrators.read().await;
        for handle in map.values() {
            handle.shutdown();
        }
    }
}
