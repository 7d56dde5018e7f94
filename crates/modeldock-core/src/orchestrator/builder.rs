use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::registry::Registry;
use super::Orchestrator;
use crate::catalog::{HubCatalog, ModelCatalog};
use crate::config::OrchestratorConfig;
use crate::deployment::{CommandRuntime, DeployableProcess, DeploymentContext, PortAllocator};
use crate::download::DownloadContext;
use crate::events::EventHub;
use crate::monitor::{ProcfsResources, ResourceProvider};
use crate::scheduler::Scheduler;
use crate::storage::{SpaceProbe, Statvfs, StorageManager};
use crate::store::TaskStore;
use crate::transfer::{CurlSource, RangeSource, TransferEngine, TransferSettings};

/// Wires the orchestrator's collaborators. Anything not supplied gets the
/// production implementation derived from the config.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    catalog: Option<Arc<dyn ModelCatalog>>,
    source: Option<Arc<dyn RangeSource>>,
    process: Option<Arc<dyn DeployableProcess>>,
    resources: Option<Arc<dyn ResourceProvider>>,
    space: Option<Arc<dyn SpaceProbe>>,
    store: Option<TaskStore>,
}

impl OrchestratorBuilder {
    pub(super) fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            catalog: None,
            source: None,
            process: None,
            resources: None,
            space: None,
            store: None,
        }
    }

    pub fn catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn range_source(mut self, source: Arc<dyn RangeSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn process(mut self, process: Arc<dyn DeployableProcess>) -> Self {
        self.process = Some(process);
        self
    }

    pub fn resources(mut self, resources: Arc<dyn ResourceProvider>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn space_probe(mut self, space: Arc<dyn SpaceProbe>) -> Self {
        self.space = Some(space);
        self
    }

    pub fn store(mut self, store: TaskStore) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        let root = config.resolved_storage_root()?;
        let space = self.space.unwrap_or_else(|| Arc::new(Statvfs));
        let storage = Arc::new(
            StorageManager::new(&root, config.min_free_bytes, config.storage_quota_bytes, space)
                .with_context(|| format!("storage root {}", root.display()))?,
        );
        let catalog = match self.catalog {
            Some(c) => c,
            None => Arc::new(HubCatalog::new(&config.catalog).context("catalog base URLs")?),
        };
        let transfer = TransferSettings::from(&config.transfer);
        let source = match self.source {
            Some(s) => s,
            None => Arc::new(CurlSource::new(transfer.stall_timeout)),
        };
        let process = self
            .process
            .unwrap_or_else(|| Arc::new(CommandRuntime::new(config.runtime.clone())));
        let resources = self
            .resources
            .unwrap_or_else(|| Arc::new(ProcfsResources::new()));
        let store = match self.store {
            Some(s) => s,
            None => TaskStore::open_at(TaskStore::default_path()?).await?,
        };

        let hub = EventHub::new();
        let scheduler = Arc::new(Scheduler::new(&config.scheduler));
        let engine = Arc::new(TransferEngine::new(
            source,
            storage.clone(),
            config.retry_policy(),
            transfer,
        ));
        let downloads = Arc::new(DownloadContext {
            engine,
            storage: storage.clone(),
            scheduler: scheduler.clone(),
            hub: hub.clone(),
            store: store.clone(),
        });
        let deployments = Arc::new(DeploymentContext {
            process,
            ports: Arc::new(PortAllocator::new(
                config.deployment.port_range_start,
                config.deployment.port_range_end,
            )),
            scheduler: scheduler.clone(),
            hub: hub.clone(),
            settings: (&config.deployment).into(),
        });
        tracing::info!(
            storage_root = %root.display(),
            max_downloads = config.scheduler.max_active_downloads,
            max_deployments = config.scheduler.max_active_deployments,
            "orchestrator built"
        );

        Ok(Orchestrator {
            config,
            catalog,
            storage,
            scheduler,
            hub,
            store,
            downloads,
            deployments,
            registry: Arc::new(Registry::default()),
            resources,
            monitor: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }
}
