//! Session registry - the live project managers of this process

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};

use super::broadcast::ProjectStatus;
use super::manager::{ManagerConfig, ProjectManager};
use crate::llm::ModelClient;
use crate::metrics::LIVE_PROJECT_MANAGERS;
use crate::patch::PatchEngineFactory;
use crate::sandbox::SandboxProvider;
use crate::store::{ChatStore, ProjectId, ProjectStore, StoreError};

/// Creates project managers on demand and reclaims idle ones
pub struct SessionRegistry {
    projects: Arc<dyn ProjectStore>,
    chats: Arc<dyn ChatStore>,
    provider: Arc<dyn SandboxProvider>,
    model: Arc<dyn ModelClient>,
    patches: Arc<dyn PatchEngineFactory>,
    config: ManagerConfig,
    managers: Mutex<HashMap<ProjectId, Arc<ProjectManager>>>,
}

impl SessionRegistry {
    pub fn new(
        projects: Arc<dyn ProjectStore>,
        chats: Arc<dyn ChatStore>,
        provider: Arc<dyn SandboxProvider>,
        model: Arc<dyn ModelClient>,
        patches: Arc<dyn PatchEngineFactory>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            projects,
            chats,
            provider,
            model,
            patches,
            config,
            managers: Mutex::new(HashMap::new()),
        })
    }

    /// The running manager for a project, or a freshly started one.
    ///
    /// The map stays locked while the project loads, so concurrent callers
    /// for the same id get the same manager.
    pub async fn get_or_create(&self, project_id: ProjectId) -> Result<Arc<ProjectManager>, StoreError> {
        let mut managers = self.managers.lock().await;
        if let Some(manager) = managers.get(&project_id) {
            return Ok(Arc::clone(manager));
        }

        let project = self.projects.load_project(project_id).await?;
        let manager = ProjectManager::new(
            project,
            Arc::clone(&self.provider),
            Arc::clone(&self.chats),
            Arc::clone(&self.model),
            Arc::clone(&self.patches),
            self.config.clone(),
        );
        manager.start();
        managers.insert(project_id, Arc::clone(&manager));
        LIVE_PROJECT_MANAGERS.inc();
        info!(project_id, "project manager created");
        Ok(manager)
    }

    pub async fn get(&self, project_id: ProjectId) -> Option<Arc<ProjectManager>> {
        self.managers.lock().await.get(&project_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.managers.lock().await.len()
    }

    /// Kill and remove every manager idle for longer than `timeout`.
    /// Returns how many were reclaimed.
    ///
    /// Idle managers leave the map before they are killed, so teardown never
    /// blocks `get_or_create` for other projects.
    pub async fn sweep(&self, timeout: Duration) -> usize {
        let idle: Vec<(ProjectId, Arc<ProjectManager>)> = {
            let mut managers = self.managers.lock().await;
            let ids: Vec<ProjectId> = managers
                .iter()
                .filter(|(_, manager)| manager.is_inactive(timeout))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| managers.remove(&id).map(|manager| (id, manager)))
                .collect()
        };

        for (project_id, manager) in &idle {
            manager.kill().await;
            LIVE_PROJECT_MANAGERS.dec();
            info!(project_id, "reclaimed idle project manager");
        }
        idle.len()
    }

    /// Run `sweep` every `interval` until the handle is aborted or the
    /// registry is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let span = info_span!("registry_sweeper");
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    let reclaimed = registry.sweep(timeout).await;
                    debug!(reclaimed, "sweep complete");
                }
            }
            .instrument(span),
        )
    }

    pub async fn statuses(&self) -> Vec<ProjectStatus> {
        let managers: Vec<_> = self.managers.lock().await.values().cloned().collect();
        let mut statuses: Vec<_> = managers.iter().map(|m| m.status()).collect();
        statuses.sort_by_key(|s| s.project_id);
        statuses
    }

    /// Kill every manager. Used on process shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.managers.lock().await.drain().collect();
        for (project_id, manager) in drained {
            manager.kill().await;
            LIVE_PROJECT_MANAGERS.dec();
            debug!(project_id, "project manager shut down");
        }
    }
}
