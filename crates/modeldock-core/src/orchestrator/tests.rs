use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use super::*;
use crate::catalog::{ModelDescriptor, StaticCatalog};
use crate::config::{DeploymentConfig, RetryConfig, SchedulerConfig, TransferConfig};
use crate::deployment::testing::FakeProcess;
use crate::monitor::{HostUsage, ModelStatusSource};
use crate::storage::FixedSpace;
use crate::transfer::testing::MemorySource;
use crate::types::ModelSource;

struct QuietHost;

impl ResourceProvider for QuietHost {
    fn sample(&self) -> io::Result<HostUsage> {
        Ok(HostUsage {
            cpu_percent: 1.0,
            memory_used_bytes: 1,
            memory_total_bytes: 100,
        })
    }
}

const SIZE: usize = 20_000;

fn payload() -> Vec<u8> {
    (0..SIZE).map(|i| (i % 241) as u8).collect()
}

fn model(name: &str) -> ModelRef {
    ModelRef::new(format!("org/{name}"), ModelSource::RemoteHub)
}

fn catalog(sized: bool) -> StaticCatalog {
    let catalog = StaticCatalog::new();
    for name in ["a", "b", "c", "d"] {
        let mut d = ModelDescriptor::from_url(&format!("mem://mirror/{name}.bin")).unwrap();
        if sized {
            d = d.with_size(SIZE as u64);
        }
        catalog.insert(&model(name), d);
    }
    catalog
}

struct Fixture {
    orch: Orchestrator,
    process: Arc<FakeProcess>,
    source: Arc<MemorySource>,
    store: TaskStore,
    _dir: TempDir,
}

struct Options {
    slots: usize,
    queue: usize,
    chunk_delay: Duration,
    sized: bool,
    store: Option<TaskStore>,
    free: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            slots: 2,
            queue: 8,
            chunk_delay: Duration::ZERO,
            sized: false,
            store: None,
            free: 1 << 30,
        }
    }
}

async fn fixture(opts: Options) -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = OrchestratorConfig {
        storage_root: Some(dir.path().join("models")),
        min_free_bytes: 0,
        scheduler: SchedulerConfig {
            max_active_downloads: opts.slots,
            max_active_deployments: 1,
            queue_capacity: opts.queue,
        },
        retry: Some(RetryConfig {
            max_attempts: 2,
            base_delay_secs: 0.001,
            max_delay_secs: 1,
        }),
        transfer: TransferConfig {
            stall_timeout_secs: 5,
            progress_interval_ms: 0,
            progress_bytes: 1,
            rate_window_secs: 1,
        },
        deployment: DeploymentConfig {
            readiness_timeout_secs: 2,
            default_host: "127.0.0.1".to_string(),
            port_range_start: 43000,
            port_range_end: 43100,
            ..DeploymentConfig::default()
        },
        ..OrchestratorConfig::default()
    };
    let store = match opts.store {
        Some(s) => s,
        None => TaskStore::in_memory().await.unwrap(),
    };
    let source = Arc::new(
        MemorySource::new(payload())
            .chunk_size(1000)
            .chunk_delay(opts.chunk_delay),
    );
    let process = Arc::new(FakeProcess::new());
    let orch = Orchestrator::builder(config)
        .catalog(Arc::new(catalog(opts.sized)))
        .range_source(source.clone())
        .process(process.clone())
        .resources(Arc::new(QuietHost))
        .space_probe(Arc::new(FixedSpace::with_free(opts.free)))
        .store(store.clone())
        .build()
        .await
        .unwrap();
    orch.start().await.unwrap();
    Fixture {
        orch,
        process,
        source,
        store,
        _dir: dir,
    }
}

fn submit(name: &str, priority: Priority) -> DownloadRequest {
    DownloadRequest {
        model: model(name),
        priority,
    }
}

async fn until_download(
    orch: &Orchestrator,
    id: TaskId,
    f: impl Fn(&DownloadSnapshot) -> bool,
) -> DownloadSnapshot {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let s = orch.get_download(id).await.unwrap();
        if f(&s) {
            return s;
        }
        assert!(Instant::now() < deadline, "download stuck in {}", s.status);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn until_evicted(orch: &Orchestrator, id: TaskId) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while orch.registry.download(id).is_some() {
        assert!(Instant::now() < deadline, "finished download still registered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A row left `downloading` by a daemon that died 5000 bytes into the artifact.
async fn interrupted_row(store: &TaskStore, name: &str) -> DownloadSnapshot {
    let mut s = DownloadSnapshot::new(uuid::Uuid::new_v4(), model(name), Priority::Normal);
    s.status = DownloadStatus::Downloading;
    s.bytes_transferred = 5000;
    s.total_bytes = Some(SIZE as u64);
    store
        .save(&StoredDownload {
            snapshot: s.clone(),
            descriptor: Some(ModelDescriptor::from_url(&format!("mem://mirror/{name}.bin")).unwrap()),
        })
        .await
        .unwrap();
    s
}

async fn until_deployment(orch: &Orchestrator, id: DeploymentId, status: DeploymentStatus) -> DeploymentSnapshot {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let s = orch.get_deployment(id).unwrap();
        if s.status == status {
            return s;
        }
        assert!(Instant::now() < deadline, "deployment stuck in {}", s.status);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn download_runs_to_completion_and_is_listed() {
    let f = fixture(Options::default()).await;
    let s = f.orch.submit_download(submit("a", Priority::Normal)).await.unwrap();
    let done = until_download(&f.orch, s.id, |s| s.status == DownloadStatus::Completed).await;
    assert_eq!(done.bytes_transferred, SIZE as u64);
    assert_eq!(std::fs::read(done.target_path.unwrap()).unwrap(), payload());

    let page = f
        .orch
        .list_downloads(Some(DownloadStatus::Completed), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, s.id);
    let none = f
        .orch
        .list_downloads(Some(DownloadStatus::Failed), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(none.total, 0);
    assert_eq!(f.orch.queue_status(Pool::Download).active_count, 0);
}

#[tokio::test]
async fn higher_priority_dispatches_first_when_a_slot_frees() {
    let f = fixture(Options {
        slots: 1,
        chunk_delay: Duration::from_millis(3),
        ..Options::default()
    })
    .await;
    let blocker = f.orch.submit_download(submit("a", Priority::Normal)).await.unwrap();
    until_download(&f.orch, blocker.id, |s| s.status == DownloadStatus::Downloading).await;
    let normal = f.orch.submit_download(submit("b", Priority::Normal)).await.unwrap();
    let high = f.orch.submit_download(submit("c", Priority::High)).await.unwrap();
    let status = f.orch.queue_status(Pool::Download);
    assert_eq!((status.depth, status.active_count), (2, 1));

    let high = until_download(&f.orch, high.id, |s| s.status == DownloadStatus::Completed).await;
    let normal = until_download(&f.orch, normal.id, |s| s.status == DownloadStatus::Completed).await;
    assert!(high.started_at.unwrap() < normal.started_at.unwrap());
}

#[tokio::test]
async fn queue_full_leaves_nothing_behind() {
    let f = fixture(Options {
        slots: 1,
        queue: 1,
        chunk_delay: Duration::from_millis(5),
        sized: true,
        ..Options::default()
    })
    .await;
    f.orch.submit_download(submit("a", Priority::Normal)).await.unwrap();
    let queued = f.orch.submit_download(submit("b", Priority::Normal)).await.unwrap();
    let err = f
        .orch
        .submit_download(submit("c", Priority::Normal))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "queue_full");
    let page = f.orch.list_downloads(None, PageRequest::default()).await.unwrap();
    assert_eq!(page.total, 2);

    // The rejected reservation was released, so the same target can be taken again.
    f.orch.cancel_download(queued.id).await.unwrap();
    f.orch.submit_download(submit("c", Priority::Normal)).await.unwrap();
}

#[tokio::test]
async fn unknown_models_are_rejected_before_anything_is_created() {
    let f = fixture(Options::default()).await;
    let err = f
        .orch
        .submit_download(DownloadRequest {
            model: model("nope"),
            priority: Priority::Normal,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "source_not_found");
    let err = f.orch.pause_download(uuid::Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn start_recovers_pending_and_interrupted_downloads() {
    let store = TaskStore::in_memory().await.unwrap();
    let descriptor = ModelDescriptor::from_url("mem://mirror/a.bin").unwrap();

    let mut interrupted = DownloadSnapshot::new(uuid::Uuid::new_v4(), model("a"), Priority::Normal);
    interrupted.status = DownloadStatus::Downloading;
    interrupted.bytes_transferred = 5000;
    interrupted.total_bytes = Some(SIZE as u64);
    store
        .save(&StoredDownload {
            snapshot: interrupted.clone(),
            descriptor: Some(descriptor.clone()),
        })
        .await
        .unwrap();
    let pending = DownloadSnapshot::new(uuid::Uuid::new_v4(), model("b"), Priority::Normal);
    store
        .save(&StoredDownload {
            snapshot: pending.clone(),
            descriptor: None,
        })
        .await
        .unwrap();

    let f = fixture(Options {
        store: Some(store),
        ..Options::default()
    })
    .await;

    let paused = f.orch.get_download(interrupted.id).await.unwrap();
    assert_eq!(paused.status, DownloadStatus::Paused);
    assert_eq!(paused.bytes_transferred, 5000);
    until_download(&f.orch, pending.id, |s| s.status == DownloadStatus::Completed).await;

    // The partial file did not survive, so the resumed transfer starts over.
    f.orch.resume_download(interrupted.id).await.unwrap();
    let done = until_download(&f.orch, interrupted.id, |s| s.status == DownloadStatus::Completed).await;
    assert_eq!(done.bytes_transferred, SIZE as u64);
    assert_eq!(done.restarts, 1);
}

#[tokio::test]
async fn deployment_uses_the_downloaded_artifact() {
    let f = fixture(Options::default()).await;
    let d = f.orch.submit_download(submit("a", Priority::Normal)).await.unwrap();
    let done = until_download(&f.orch, d.id, |s| s.status == DownloadStatus::Completed).await;

    let dep = f
        .orch
        .submit_deployment(DeploymentRequest {
            model: model("a"),
            name: Some("chat".to_string()),
            host: None,
            port: None,
            limits: ResourceLimits {
                gpu_device: Some("0".to_string()),
                ..ResourceLimits::default()
            },
            priority: Priority::Normal,
        })
        .await
        .unwrap();
    let running = until_deployment(&f.orch, dep.id, DeploymentStatus::Running).await;
    assert_eq!(running.name, "chat");
    assert_eq!(running.binding.as_ref().unwrap().host, "127.0.0.1");

    let launch = f.process.last_launch.lock().clone().unwrap();
    assert_eq!(launch.model_path, done.target_path);
    assert_eq!(launch.limits.gpu_device.as_deref(), Some("0"));

    let health = f.orch.deployment_health(dep.id).unwrap();
    assert_eq!(health.status, DeploymentStatus::Running);
    assert_eq!(f.orch.deployment_logs(dep.id, 3).await.unwrap().len(), 3);

    until_evicted(&f.orch, d.id).await;
    let status = f.orch.registry.model_status();
    let entry = status.models.iter().find(|m| m.model == model("a")).unwrap();
    assert!(entry.downloads.is_empty());
    assert_eq!(entry.deployments.len(), 1);

    let page = f.orch.list_deployments(Some(DeploymentStatus::Running), PageRequest::default());
    assert_eq!(page.total, 1);

    f.orch.delete_deployment(dep.id).await.unwrap();
    assert_eq!(f.orch.get_deployment(dep.id).unwrap_err().kind(), "not_found");
    assert_eq!(f.orch.queue_status(Pool::Deployment).active_count, 0);
}

#[tokio::test]
async fn deleted_downloads_are_forgotten() {
    let f = fixture(Options::default()).await;
    let s = f.orch.submit_download(submit("a", Priority::Normal)).await.unwrap();
    until_download(&f.orch, s.id, |s| s.status == DownloadStatus::Completed).await;

    f.orch.delete_download(s.id).await.unwrap();
    assert_eq!(f.orch.get_download(s.id).await.unwrap_err().kind(), "not_found");
    assert!(f.store.get(s.id).await.unwrap().is_none());
    assert_eq!(f.orch.delete_download(s.id).await.unwrap_err().kind(), "not_found");
}

#[tokio::test]
async fn shutdown_pauses_transfers_and_refuses_new_work() {
    let f = fixture(Options {
        chunk_delay: Duration::from_millis(5),
        ..Options::default()
    })
    .await;
    let s = f.orch.submit_download(submit("a", Priority::Normal)).await.unwrap();
    until_download(&f.orch, s.id, |s| s.bytes_transferred >= 2000).await;

    let mut conn = f.orch.hub().connect();
    f.orch.hub().subscribe_all(conn.id());
    f.orch.shutdown().await;

    let stored = f.store.get(s.id).await.unwrap().unwrap();
    assert_eq!(stored.snapshot.status, DownloadStatus::Paused);
    assert!(stored.snapshot.bytes_transferred >= 2000);
    assert!(f.source.opened_at().len() == 1);

    let err = f.orch.submit_download(submit("b", Priority::Normal)).await.unwrap_err();
    assert_eq!(err.kind(), "shutting_down");
    assert_eq!(f.orch.hub().connection_count(), 0);
    while conn.try_recv().is_some() {}
    assert!(conn.recv().await.is_none());
}

#[tokio::test]
async fn finished_downloads_leave_the_live_registry() {
    let f = fixture(Options::default()).await;
    let s = f.orch.submit_download(submit("a", Priority::Normal)).await.unwrap();
    until_download(&f.orch, s.id, |s| s.status == DownloadStatus::Completed).await;
    until_evicted(&f.orch, s.id).await;

    assert!(f.orch.registry.downloads().is_empty());
    assert!(f.orch.registry.model_status().models.is_empty());
    // The stored record still answers reads and rejects commands.
    let stored = f.orch.get_download(s.id).await.unwrap();
    assert_eq!(stored.status, DownloadStatus::Completed);
    let err = f.orch.pause_download(s.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
    let page = f.orch.list_downloads(None, PageRequest::default()).await.unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn recovered_download_resumes_into_its_preallocated_file() {
    let store = TaskStore::in_memory().await.unwrap();
    let interrupted = interrupted_row(&store, "a").await;
    let f = fixture(Options {
        store: Some(store),
        free: 15_000,
        ..Options::default()
    })
    .await;

    // The earlier run preallocated the whole artifact and wrote its first 5000 bytes.
    let target = f.orch.storage.allocate_path(&model("a"), "a.bin").unwrap();
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    let mut partial = payload();
    partial[5000..].fill(0);
    std::fs::write(crate::storage::temp_path(&target), &partial).unwrap();

    f.orch.resume_download(interrupted.id).await.unwrap();
    let done = until_download(&f.orch, interrupted.id, |s| s.status.is_terminal()).await;
    assert_eq!(done.status, DownloadStatus::Completed, "{:?}", done.error);
    assert_eq!(done.restarts, 0);
    assert_eq!(std::fs::read(&target).unwrap(), payload());
    assert_eq!(f.source.opened_at(), vec![5000]);
}

#[tokio::test]
async fn resume_without_room_keeps_the_download_paused() {
    let store = TaskStore::in_memory().await.unwrap();
    let interrupted = interrupted_row(&store, "a").await;
    let f = fixture(Options {
        store: Some(store),
        free: 15_000,
        ..Options::default()
    })
    .await;

    // No partial file survived, so the whole artifact needs room again.
    let err = f.orch.resume_download(interrupted.id).await.unwrap_err();
    assert_eq!(err.kind(), "insufficient_space");
    let s = f.orch.get_download(interrupted.id).await.unwrap();
    assert_eq!(s.status, DownloadStatus::Paused);
    assert_eq!(s.bytes_transferred, 5000);
    assert!(s.error.is_none());
    assert_eq!(f.orch.queue_status(Pool::Download).active_count, 0);
    assert_eq!(f.orch.storage_usage().unwrap().reserved, 0);
    assert!(f.source.opened_at().is_empty());
}
