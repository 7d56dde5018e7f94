//! Live actor handles, keyed by id.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::deployment::DeploymentHandle;
use crate::download::DownloadHandle;
use crate::events::{DeploymentBrief, DownloadBrief, ModelStatusEntry, ModelStatusSample};
use crate::monitor::ModelStatusSource;
use crate::types::{DeploymentId, ModelRef, TaskId};

#[derive(Default)]
pub(super) struct Registry {
    downloads: RwLock<HashMap<TaskId, DownloadHandle>>,
    deployments: RwLock<HashMap<DeploymentId, DeploymentHandle>>,
}

impl Registry {
    /// Track a live download. Once its actor exits in a terminal state the
    /// handle is dropped; the stored record answers for it from then on.
    pub(super) fn insert_download(self: &Arc<Self>, handle: DownloadHandle) {
        let id = handle.id();
        let mut snapshots = handle.watch();
        self.downloads.write().insert(id, handle);
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {}
            let terminal = snapshots.borrow().status.is_terminal();
            if let Some(registry) = registry.upgrade().filter(|_| terminal) {
                registry.remove_download(id);
                tracing::debug!(task_id = %id, "finished download left the registry");
            }
        });
    }

    pub(super) fn download(&self, id: TaskId) -> Option<DownloadHandle> {
        self.downloads.read().get(&id).cloned()
    }

    pub(super) fn remove_download(&self, id: TaskId) -> Option<DownloadHandle> {
        self.downloads.write().remove(&id)
    }

    pub(super) fn downloads(&self) -> Vec<DownloadHandle> {
        self.downloads.read().values().cloned().collect()
    }

    pub(super) fn insert_deployment(&self, handle: DeploymentHandle) {
        self.deployments.write().insert(handle.id(), handle);
    }

    pub(super) fn deployment(&self, id: DeploymentId) -> Option<DeploymentHandle> {
        self.deployments.read().get(&id).cloned()
    }

    pub(super) fn remove_deployment(&self, id: DeploymentId) -> Option<DeploymentHandle> {
        self.deployments.write().remove(&id)
    }

    pub(super) fn deployments(&self) -> Vec<DeploymentHandle> {
        self.deployments.read().values().cloned().collect()
    }
}

fn slot<'a>(models: &'a mut BTreeMap<String, ModelStatusEntry>, model: &ModelRef) -> &'a mut ModelStatusEntry {
    models
        .entry(model.to_string())
        .or_insert_with(|| ModelStatusEntry {
            model: model.clone(),
            downloads: Vec::new(),
            deployments: Vec::new(),
        })
}

impl ModelStatusSource for Registry {
    fn model_status(&self) -> ModelStatusSample {
        let mut models = BTreeMap::new();
        for handle in self.downloads.read().values() {
            let s = handle.snapshot();
            slot(&mut models, &s.model).downloads.push(DownloadBrief {
                id: s.id,
                status: s.status,
                progress: s.progress,
            });
        }
        for handle in self.deployments.read().values() {
            let s = handle.snapshot();
            slot(&mut models, &s.model).deployments.push(DeploymentBrief {
                id: s.id,
                status: s.status,
                health: s.health,
            });
        }
        ModelStatusSample {
            models: models.into_values().collect(),
        }
    }
}
