//! End-to-end downloads over HTTP: a local range server, the libcurl source
//! and a fully wired orchestrator.

mod common;

use sha2::{Digest, Sha256};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use common::range_server::{self, RangeServer, ServerOptions};
use modeldock_core::catalog::{ModelDescriptor, StaticCatalog};
use modeldock_core::config::{OrchestratorConfig, RetryConfig, TransferConfig};
use modeldock_core::events::{ActivityEvent, Alert, AlertLevel, Channel, Connection, Event};
use modeldock_core::monitor::{HostUsage, ResourceProvider};
use modeldock_core::store::TaskStore;
use modeldock_core::types::{DownloadSnapshot, DownloadStatus, ModelRef, ModelSource, Priority, TaskId};
use modeldock_core::{DownloadRequest, Orchestrator};

const SIZE: usize = 256 * 1024;

struct QuietHost;

impl ResourceProvider for QuietHost {
    fn sample(&self) -> io::Result<HostUsage> {
        Ok(HostUsage {
            cpu_percent: 0.0,
            memory_used_bytes: 0,
            memory_total_bytes: 1,
        })
    }
}

fn body() -> Vec<u8> {
    (0..SIZE).map(|i| (i % 251) as u8).collect()
}

fn model() -> ModelRef {
    ModelRef::new("org/tiny", ModelSource::RemoteHub)
}

struct Setup {
    orch: Orchestrator,
    server: RangeServer,
    _dir: TempDir,
}

async fn setup(opts: ServerOptions, sha256: Option<String>) -> Setup {
    let server = range_server::start(body(), opts);
    let mut descriptor = ModelDescriptor::from_url(&server.url).unwrap();
    if let Some(sum) = sha256 {
        descriptor = descriptor.with_sha256(sum);
    }
    let catalog = StaticCatalog::new().with(&model(), descriptor);

    let dir = TempDir::new().unwrap();
    let config = OrchestratorConfig {
        storage_root: Some(dir.path().join("models")),
        min_free_bytes: 0,
        retry: Some(RetryConfig {
            max_attempts: 2,
            base_delay_secs: 0.01,
            max_delay_secs: 1,
        }),
        transfer: TransferConfig {
            stall_timeout_secs: 10,
            progress_interval_ms: 0,
            progress_bytes: 1,
            rate_window_secs: 1,
        },
        ..OrchestratorConfig::default()
    };
    let orch = Orchestrator::builder(config)
        .catalog(Arc::new(catalog))
        .resources(Arc::new(QuietHost))
        .store(TaskStore::in_memory().await.unwrap())
        .build()
        .await
        .unwrap();
    orch.start().await.unwrap();
    Setup {
        orch,
        server,
        _dir: dir,
    }
}

fn request() -> DownloadRequest {
    DownloadRequest {
        model: model(),
        priority: Priority::Normal,
    }
}

async fn until(
    orch: &Orchestrator,
    id: TaskId,
    f: impl Fn(&DownloadSnapshot) -> bool,
) -> DownloadSnapshot {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let s = orch.get_download(id).await.unwrap();
        if f(&s) {
            return s;
        }
        assert!(Instant::now() < deadline, "download stuck in {} at {}", s.status, s.bytes_transferred);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn activity(conn: &mut Connection) -> Vec<ActivityEvent> {
    let mut out = Vec::new();
    while let Some(env) = conn.try_recv() {
        if let Event::Activity(ev) = env.event {
            out.push(ev);
        }
    }
    out
}

#[tokio::test]
async fn download_completes_and_matches_checksum() {
    let sum = hex::encode(Sha256::digest(body()));
    let s = setup(ServerOptions::default(), Some(sum)).await;

    let task = s.orch.submit_download(request()).await.unwrap();
    let done = until(&s.orch, task.id, |d| d.status.is_terminal()).await;
    assert_eq!(done.status, DownloadStatus::Completed, "error: {:?}", done.error);
    assert_eq!(done.total_bytes, Some(SIZE as u64));
    assert_eq!(done.progress, 1.0);

    let path = done.target_path.unwrap();
    assert!(path.ends_with("model.bin"));
    assert_eq!(std::fs::read(&path).unwrap(), body());
    assert!(!modeldock_core::storage::temp_path(&path).exists());
}

#[tokio::test]
async fn checksum_mismatch_fails_the_download() {
    let s = setup(ServerOptions::default(), Some("00".repeat(32))).await;
    let task = s.orch.submit_download(request()).await.unwrap();
    let done = until(&s.orch, task.id, |d| d.status.is_terminal()).await;
    assert_eq!(done.status, DownloadStatus::Failed);
    assert!(done.error.unwrap().contains("checksum"));
}

#[tokio::test]
async fn paused_download_resumes_from_its_offset() {
    let sum = hex::encode(Sha256::digest(body()));
    let s = setup(ServerOptions::trickle(), Some(sum)).await;
    let mut conn = s.orch.hub().connect();
    s.orch.hub().subscribe(conn.id(), Channel::ActivityStream);

    let task = s.orch.submit_download(request()).await.unwrap();
    until(&s.orch, task.id, |d| d.bytes_transferred >= (SIZE as u64) * 2 / 5).await;
    let paused = s.orch.pause_download(task.id).await.unwrap();
    assert_eq!(paused.status, DownloadStatus::Paused);
    let offset = paused.bytes_transferred;
    assert!(offset > 0 && offset < SIZE as u64);

    s.orch.resume_download(task.id).await.unwrap();
    let done = until(&s.orch, task.id, |d| d.status.is_terminal()).await;
    assert_eq!(done.status, DownloadStatus::Completed, "error: {:?}", done.error);
    assert_eq!(done.restarts, 0);
    assert_eq!(std::fs::read(done.target_path.unwrap()).unwrap(), body());
    assert_eq!(s.server.gets(), 2);
    // The second request picks up exactly where the paused one stopped.
    assert_eq!(s.server.range_starts()[1], Some(offset));

    let events = activity(&mut conn);
    assert!(events.iter().any(
        |e| matches!(e, ActivityEvent::DownloadResumed { offset: o, .. } if *o == offset)
    ));
    // Progress never goes backwards within one transfer epoch.
    let bytes: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ActivityEvent::DownloadProgress { bytes_transferred, .. } => Some(*bytes_transferred),
            _ => None,
        })
        .collect();
    assert!(bytes.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn server_without_ranges_restarts_from_zero() {
    let opts = ServerOptions {
        support_ranges: false,
        ..ServerOptions::trickle()
    };
    let s = setup(opts, None).await;
    let mut conn = s.orch.hub().connect();
    s.orch.hub().subscribe(conn.id(), Channel::ActivityStream);

    let task = s.orch.submit_download(request()).await.unwrap();
    until(&s.orch, task.id, |d| d.bytes_transferred >= (SIZE as u64) / 4).await;
    s.orch.pause_download(task.id).await.unwrap();
    s.orch.resume_download(task.id).await.unwrap();

    let done = until(&s.orch, task.id, |d| d.status.is_terminal()).await;
    assert_eq!(done.status, DownloadStatus::Completed, "error: {:?}", done.error);
    assert_eq!(done.restarts, 1);
    assert_eq!(std::fs::read(done.target_path.unwrap()).unwrap(), body());
    assert!(activity(&mut conn)
        .iter()
        .any(|e| matches!(e, ActivityEvent::TransferRestarted { task_id, .. } if *task_id == task.id)));
}

#[tokio::test]
async fn missing_artifact_fails_with_an_alert() {
    let opts = ServerOptions {
        missing: true,
        ..ServerOptions::default()
    };
    let s = setup(opts, None).await;
    let mut alerts = s.orch.hub().connect();
    s.orch.hub().subscribe(alerts.id(), Channel::SystemAlerts);

    let task = s.orch.submit_download(request()).await.unwrap();
    let done = until(&s.orch, task.id, |d| d.status.is_terminal()).await;
    assert_eq!(done.status, DownloadStatus::Failed);
    assert!(done.error.is_some());
    assert_eq!(s.orch.storage_usage().unwrap().reserved, 0);

    let env = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
        .await
        .unwrap()
        .unwrap();
    match env.event {
        Event::Alert(Alert { level, subject, .. }) => {
            assert_eq!(level, AlertLevel::Warning);
            assert_eq!(subject, Some(task.id));
        }
        other => panic!("unexpected {other:?}"),
    }
}
