//! Control socket round trip against a live orchestrator.

use modeldock_core::config::OrchestratorConfig;
use modeldock_core::control::{QueueReport, Reply, Request};
use modeldock_core::events::{Alert, AlertLevel, Channel, Event};
use modeldock_core::monitor::{HostUsage, ResourceProvider};
use modeldock_core::storage::FixedSpace;
use modeldock_core::store::TaskStore;
use modeldock_core::Orchestrator;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::cli::control_socket::{spawn_control_listener, ControlClient};

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

struct Daemon {
    orch: Arc<Orchestrator>,
    dir: TempDir,
    listener: tokio::task::JoinHandle<()>,
}

impl Daemon {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig {
            storage_root: Some(dir.path().join("models")),
            min_free_bytes: 0,
            ..OrchestratorConfig::default()
        };
        let orch = Orchestrator::builder(config)
            .resources(Arc::new(QuietHost))
            .space_probe(Arc::new(FixedSpace::with_free(1 << 30)))
            .store(TaskStore::in_memory().await.unwrap())
            .build()
            .await
            .unwrap();
        orch.start().await.unwrap();
        let orch = Arc::new(orch);
        let listener = spawn_control_listener(orch.clone(), dir.path().join("run/control.sock")).unwrap();
        Self {
            orch,
            dir,
            listener,
        }
    }

    async fn client(&self) -> ControlClient {
        ControlClient::connect(&self.dir.path().join("run/control.sock"))
            .await
            .unwrap()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[tokio::test]
async fn queue_status_round_trips() {
    let d = Daemon::start().await;
    let mut client = d.client().await;
    let report: QueueReport = client.call_as(&Request::QueueStatus).await.unwrap();
    assert_eq!(report.download.depth, 0);
    assert_eq!(report.download.limit, OrchestratorConfig::default().scheduler.max_active_downloads);
    assert_eq!(report.deployment.active_count, 0);
}

#[tokio::test]
async fn errors_carry_their_kind() {
    let d = Daemon::start().await;
    let mut client = d.client().await;
    let err = client
        .call(&Request::GetDownload { id: uuid::Uuid::new_v4() })
        .await
        .unwrap_err();
    assert!(err.to_string().ends_with("(not_found)"), "{err}");
}

#[tokio::test]
async fn malformed_lines_get_a_bad_request_reply() {
    let d = Daemon::start().await;
    let mut raw = UnixStream::connect(d.dir.path().join("run/control.sock"))
        .await
        .unwrap();
    raw.write_all(b"{\"op\":\"launch_missiles\"}\n").await.unwrap();
    let (read, _write) = raw.into_split();
    let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(read));
    let line = lines.next_line().await.unwrap().unwrap();
    match serde_json::from_str::<Reply>(&line).unwrap() {
        Reply::Error { error, .. } => assert_eq!(error, "bad_request"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn subscribed_clients_receive_events_until_they_leave() {
    let d = Daemon::start().await;
    let mut client = d.client().await;
    let subscribed: Vec<Channel> = client
        .call_as(&Request::Subscribe {
            channels: vec![Channel::SystemAlerts],
        })
        .await
        .unwrap();
    assert_eq!(subscribed, vec![Channel::SystemAlerts]);
    let before = d.orch.hub().subscriber_count(Channel::SystemAlerts);
    assert!(before >= 1);

    d.orch.hub().publish(Alert::new(AlertLevel::Warning, "disk", "disk at 85%"));
    let env = tokio::time::timeout(Duration::from_secs(5), client.next_event())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match env.event {
        Event::Alert(a) => assert_eq!(a.message, "disk at 85%"),
        other => panic!("unexpected {other:?}"),
    }

    drop(client);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while d.orch.hub().subscriber_count(Channel::SystemAlerts) >= before {
        assert!(tokio::time::Instant::now() < deadline, "subscription outlived its client");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
