//! The orchestrator: one explicitly constructed instance owning the catalog,
//! storage, scheduler, event hub and every live task actor.
//!
//! Lifecycle: [`Orchestrator::builder`] → [`Orchestrator::start`] (recover
//! persisted downloads, start the monitor) → operations → [`Orchestrator::shutdown`].

mod builder;
mod registry;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::ModelCatalog;
use crate::config::OrchestratorConfig;
use crate::deployment::{spawn_deployment, DeploymentContext, DeploymentHandle};
use crate::download::{spawn_download, DownloadContext, DownloadHandle, DownloadStart};
use crate::error::{OrchestratorError, Result};
use crate::events::EventHub;
use crate::monitor::{Monitor, MonitorHandle, ResourceProvider};
use crate::scheduler::{Pool, QueueStatus, Scheduler};
use crate::storage::{StorageManager, StorageUsage};
use crate::store::{StoredDownload, TaskStore};
use crate::types::{
    DeploymentId, DeploymentSnapshot, DeploymentStatus, DownloadSnapshot, DownloadStatus,
    HealthReport, ModelRef, Page, PageRequest, Priority, ResourceLimits, TaskId,
};

pub use builder::OrchestratorBuilder;
use registry::Registry;

/// Arguments of submit-download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub model: ModelRef,
    #[serde(default)]
    pub priority: Priority,
}

/// Arguments of submit-deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub model: ModelRef,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub priority: Priority,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    catalog: Arc<dyn ModelCatalog>,
    storage: Arc<StorageManager>,
    scheduler: Arc<Scheduler>,
    hub: EventHub,
    store: TaskStore,
    downloads: Arc<DownloadContext>,
    deployments: Arc<DeploymentContext>,
    registry: Arc<Registry>,
    resources: Arc<dyn ResourceProvider>,
    monitor: Mutex<Option<MonitorHandle>>,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue_status(&self, pool: Pool) -> QueueStatus {
        self.scheduler.queue_status(pool)
    }

    pub fn storage_usage(&self) -> Result<StorageUsage> {
        Ok(self.storage.usage()?)
    }

    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(OrchestratorError::ShuttingDown);
        }
        Ok(())
    }

    /// Reload persisted downloads and start periodic sampling.
    pub async fn start(&self) -> Result<()> {
        self.recover().await?;
        let monitor = Monitor {
            provider: self.resources.clone(),
            status: self.registry.clone(),
            storage: self.storage.clone(),
            scheduler: self.scheduler.clone(),
            hub: self.hub.clone(),
            config: self.config.monitor.clone(),
        };
        let previous = self.monitor.lock().replace(monitor.spawn());
        if let Some(previous) = previous {
            previous.stop().await;
        }
        Ok(())
    }

    /// Pending tasks are queued again; interrupted ones come back paused.
    async fn recover(&self) -> Result<()> {
        for record in self.store.recover().await? {
            let StoredDownload {
                snapshot,
                descriptor,
            } = record;
            let id = snapshot.id;
            let descriptor = match descriptor {
                Some(d) => d,
                None => match self.catalog.resolve(&snapshot.model).await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(task_id = %id, model = %snapshot.model, "cannot recover download: {}", e);
                        continue;
                    }
                },
            };
            let start = if snapshot.status == DownloadStatus::Pending {
                match self.scheduler.admit(Pool::Download, id, snapshot.priority) {
                    Ok(admission) => DownloadStart::Admitted(admission),
                    Err(e) => {
                        tracing::warn!(task_id = %id, "cannot requeue recovered download: {}", e);
                        continue;
                    }
                }
            } else {
                DownloadStart::Paused
            };
            tracing::info!(task_id = %id, status = %snapshot.status, offset = snapshot.bytes_transferred, "recovered download");
            let handle = spawn_download(self.downloads.clone(), snapshot, descriptor, None, start);
            self.registry.insert_download(handle);
        }
        Ok(())
    }

    /// Pause transfers (offsets persisted), stop deployments, close every
    /// subscriber connection and stop the monitor.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("orchestrator shutting down");
        for handle in self.registry.downloads() {
            handle.shutdown().await;
        }
        for handle in self.registry.deployments() {
            handle.shutdown().await;
        }
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        self.hub.close_all();
        tracing::info!("orchestrator stopped");
    }

    // Downloads

    pub async fn submit_download(&self, request: DownloadRequest) -> Result<DownloadSnapshot> {
        self.check_running()?;
        let DownloadRequest { model, priority } = request;
        let descriptor = self.catalog.resolve(&model).await?;
        let reservation = self.storage.reserve(
            &model,
            &descriptor.file_name,
            descriptor.expected_size.unwrap_or(0),
        )?;
        let id = Uuid::new_v4();
        let admission = match self.scheduler.admit(Pool::Download, id, priority) {
            Ok(a) => a,
            Err(e) => {
                self.storage.release(&reservation);
                return Err(e);
            }
        };
        tracing::info!(task_id = %id, model = %model, url = %descriptor.url, ?priority, "download submitted");
        let snapshot = DownloadSnapshot::new(id, model, priority);
        let handle = spawn_download(
            self.downloads.clone(),
            snapshot,
            descriptor,
            Some(reservation),
            DownloadStart::Admitted(admission),
        );
        let snapshot = handle.snapshot();
        self.registry.insert_download(handle);
        Ok(snapshot)
    }

    /// Live handle for `command`. A finished task only has its stored record,
    /// so every command on it is an invalid transition.
    async fn download_handle(&self, id: TaskId, command: &'static str) -> Result<DownloadHandle> {
        if let Some(handle) = self.registry.download(id) {
            return Ok(handle);
        }
        match self.store.get(id).await? {
            Some(record) => Err(OrchestratorError::invalid(command, "download", record.snapshot.status)),
            None => Err(OrchestratorError::download_not_found(id)),
        }
    }

    pub async fn pause_download(&self, id: TaskId) -> Result<DownloadSnapshot> {
        self.download_handle(id, "pause").await?.pause().await
    }

    pub async fn resume_download(&self, id: TaskId) -> Result<DownloadSnapshot> {
        self.check_running()?;
        self.download_handle(id, "resume").await?.resume().await
    }

    pub async fn cancel_download(&self, id: TaskId) -> Result<DownloadSnapshot> {
        self.download_handle(id, "cancel").await?.cancel().await
    }

    /// Live snapshot, or the stored record of a task from an earlier run.
    pub async fn get_download(&self, id: TaskId) -> Result<DownloadSnapshot> {
        if let Some(handle) = self.registry.download(id) {
            return Ok(handle.snapshot());
        }
        self.store
            .get(id)
            .await?
            .map(|r| r.snapshot)
            .ok_or_else(|| OrchestratorError::download_not_found(id))
    }

    /// Oldest first, optionally filtered by status.
    pub async fn list_downloads(
        &self,
        status: Option<DownloadStatus>,
        page: PageRequest,
    ) -> Result<Page<DownloadSnapshot>> {
        let mut all: Vec<DownloadSnapshot> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|r| r.snapshot)
            .filter(|s| self.registry.download(s.id).is_none())
            .collect();
        all.extend(self.registry.downloads().iter().map(|h| h.snapshot()));
        all.retain(|s| status.map_or(true, |want| s.status == want));
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(Page::paginate(all, page))
    }

    /// Cancel if still active, then forget the task. A completed artifact stays on disk.
    pub async fn delete_download(&self, id: TaskId) -> Result<()> {
        let handle = self.registry.download(id);
        if let Some(handle) = &handle {
            if !handle.snapshot().status.is_terminal() {
                if let Err(e) = handle.cancel().await {
                    tracing::debug!(task_id = %id, "cancel before delete: {}", e);
                }
            }
            self.registry.remove_download(id);
        }
        let removed = self.store.remove(id).await?;
        if handle.is_none() && !removed {
            return Err(OrchestratorError::download_not_found(id));
        }
        tracing::info!(task_id = %id, "download deleted");
        Ok(())
    }

    /// Final path of a completed download of `model`, if any.
    async fn local_artifact(&self, model: &ModelRef) -> Option<PathBuf> {
        let completed = |s: &DownloadSnapshot| {
            s.status == DownloadStatus::Completed && s.model.id == model.id && s.model.source == model.source
        };
        if let Some(path) = self
            .registry
            .downloads()
            .iter()
            .map(|h| h.snapshot())
            .filter(|s| completed(s))
            .find_map(|s| s.target_path)
        {
            return Some(path);
        }
        match self.store.list().await {
            Ok(records) => records
                .into_iter()
                .map(|r| r.snapshot)
                .filter(|s| completed(s))
                .find_map(|s| s.target_path),
            Err(e) => {
                tracing::debug!("store lookup for local artifact: {:#}", e);
                None
            }
        }
    }

    // Deployments

    pub async fn submit_deployment(&self, request: DeploymentRequest) -> Result<DeploymentSnapshot> {
        self.check_running()?;
        let id = Uuid::new_v4();
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", request.model.id.replace('/', "-"), &id.simple().to_string()[..8]));
        let mut snapshot = DeploymentSnapshot::new(id, request.model.clone(), name, request.priority);
        snapshot.host = request
            .host
            .clone()
            .unwrap_or_else(|| self.config.deployment.default_host.clone());
        snapshot.preferred_port = request.port;
        snapshot.limits = request.limits.clone();

        let model_path = self.local_artifact(&request.model).await;
        let admission = self.scheduler.admit(Pool::Deployment, id, request.priority)?;
        tracing::info!(
            deployment_id = %id,
            model = %request.model,
            local_artifact = model_path.is_some(),
            "deployment submitted"
        );
        let handle = spawn_deployment(self.deployments.clone(), snapshot, model_path, admission);
        let snapshot = handle.snapshot();
        self.registry.insert_deployment(handle);
        Ok(snapshot)
    }

    fn deployment_handle(&self, id: DeploymentId) -> Result<DeploymentHandle> {
        self.registry
            .deployment(id)
            .ok_or_else(|| OrchestratorError::deployment_not_found(id))
    }

    pub async fn stop_deployment(&self, id: DeploymentId) -> Result<DeploymentSnapshot> {
        self.deployment_handle(id)?.stop().await
    }

    pub async fn restart_deployment(&self, id: DeploymentId) -> Result<DeploymentSnapshot> {
        self.check_running()?;
        self.deployment_handle(id)?.restart().await
    }

    /// Explicit redeploy of a stopped or failed deployment.
    pub async fn start_deployment(&self, id: DeploymentId) -> Result<DeploymentSnapshot> {
        self.check_running()?;
        self.deployment_handle(id)?.start().await
    }

    pub fn get_deployment(&self, id: DeploymentId) -> Result<DeploymentSnapshot> {
        Ok(self.deployment_handle(id)?.snapshot())
    }

    pub fn list_deployments(
        &self,
        status: Option<DeploymentStatus>,
        page: PageRequest,
    ) -> Page<DeploymentSnapshot> {
        let mut all: Vec<DeploymentSnapshot> = self
            .registry
            .deployments()
            .iter()
            .map(|h| h.snapshot())
            .filter(|s| status.map_or(true, |want| s.status == want))
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Page::paginate(all, page)
    }

    pub async fn deployment_logs(&self, id: DeploymentId, lines: usize) -> Result<Vec<String>> {
        Ok(self.deployment_handle(id)?.logs(lines).await)
    }

    pub fn deployment_health(&self, id: DeploymentId) -> Result<HealthReport> {
        Ok(self.deployment_handle(id)?.health())
    }

    /// Stop if active, then forget the deployment and its retained logs.
    pub async fn delete_deployment(&self, id: DeploymentId) -> Result<()> {
        let handle = self
            .registry
            .remove_deployment(id)
            .ok_or_else(|| OrchestratorError::deployment_not_found(id))?;
        handle.shutdown().await;
        handle.release_process().await;
        tracing::info!(deployment_id = %id, "deployment deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
