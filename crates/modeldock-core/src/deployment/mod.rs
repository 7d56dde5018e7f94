//! Deployment state machine.
//!
//! Like downloads, each deployment is an actor owning its record. Launch,
//! readiness, probing and termination go through [`DeployableProcess`], so
//! the state machine never touches a child process directly.

mod actor;
mod health;
mod ports;
mod process;
mod runtime;
#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::DeploymentConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::EventHub;
use crate::scheduler::{Admission, Scheduler};
use crate::types::{DeploymentId, DeploymentSnapshot, HealthReport};
use actor::DeploymentActor;

pub use ports::PortAllocator;
pub use process::{DeployableProcess, LaunchSpec, ProcessError, TerminateMode};
pub use runtime::CommandRuntime;

#[derive(Debug, Clone)]
pub struct DeploymentSettings {
    pub readiness_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub grace_period: Duration,
}

impl From<&DeploymentConfig> for DeploymentSettings {
    fn from(c: &DeploymentConfig) -> Self {
        Self {
            readiness_timeout: Duration::from_secs(c.readiness_timeout_secs),
            probe_interval: Duration::from_secs(c.probe_interval_secs.max(1)),
            probe_timeout: Duration::from_secs(c.probe_timeout_secs.max(1)),
            failure_threshold: c.failure_threshold.max(1),
            grace_period: Duration::from_secs(c.grace_period_secs),
        }
    }
}

/// Collaborators shared by every deployment actor.
pub struct DeploymentContext {
    pub process: Arc<dyn DeployableProcess>,
    pub ports: Arc<PortAllocator>,
    pub scheduler: Arc<Scheduler>,
    pub hub: EventHub,
    pub settings: DeploymentSettings,
}

type Reply = oneshot::Sender<Result<DeploymentSnapshot>>;

enum Command {
    Stop(Reply),
    Restart(Reply),
    Start(Reply),
    /// Stop a live process and exit.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct DeploymentHandle {
    id: DeploymentId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<DeploymentSnapshot>,
    process: Arc<dyn DeployableProcess>,
}

impl DeploymentHandle {
    pub fn id(&self) -> DeploymentId {
        self.id
    }

    pub fn snapshot(&self) -> DeploymentSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<DeploymentSnapshot> {
        self.snapshot.clone()
    }

    async fn request(&self, name: &'static str, make: impl FnOnce(Reply) -> Command) -> Result<DeploymentSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).is_err() {
            return Err(self.rejected(name));
        }
        rx.await.unwrap_or_else(|_| Err(self.rejected(name)))
    }

    fn rejected(&self, command: &'static str) -> OrchestratorError {
        OrchestratorError::invalid(command, "deployment", self.snapshot.borrow().status)
    }

    /// Graceful stop; valid only while running.
    pub async fn stop(&self) -> Result<DeploymentSnapshot> {
        self.request("stop", Command::Stop).await
    }

    /// Stop then start on the same scheduler slot; valid while running or stopped.
    pub async fn restart(&self) -> Result<DeploymentSnapshot> {
        self.request("restart", Command::Restart).await
    }

    /// Redeploy a stopped or failed deployment.
    pub async fn start(&self) -> Result<DeploymentSnapshot> {
        self.request("start", Command::Start).await
    }

    pub fn health(&self) -> HealthReport {
        let s = self.snapshot.borrow();
        HealthReport {
            id: s.id,
            status: s.status,
            health: s.health,
            consecutive_failures: s.consecutive_probe_failures,
            last_check: s.last_health_check,
        }
    }

    /// Most recent output of the live process, or of the last one when stopped.
    pub async fn logs(&self, lines: usize) -> Vec<String> {
        let handle = {
            let s = self.snapshot.borrow();
            s.process.clone().or_else(|| s.last_process.clone())
        };
        let Some(handle) = handle else {
            return Vec::new();
        };
        match self.process.logs(&handle, lines).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(deployment_id = %self.id, "logs unavailable: {}", e);
                Vec::new()
            }
        }
    }

    /// Stop any live process and end the actor.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Forget the last process (its retained logs included). Only for deleted deployments.
    pub async fn release_process(&self) {
        let handle = {
            let s = self.snapshot.borrow();
            s.process.clone().or_else(|| s.last_process.clone())
        };
        if let Some(handle) = handle {
            self.process.release(&handle).await;
        }
    }
}

/// Start the actor for one deployment.
pub fn spawn_deployment(
    ctx: Arc<DeploymentContext>,
    snapshot: DeploymentSnapshot,
    model_path: Option<PathBuf>,
    admission: Admission,
) -> DeploymentHandle {
    let id = snapshot.id;
    let process = ctx.process.clone();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (snap_tx, snap_rx) = watch::channel(snapshot.clone());
    let actor = DeploymentActor::new(ctx, snapshot, model_path, snap_tx);
    tokio::spawn(actor.run(cmd_rx, admission));
    DeploymentHandle {
        id,
        commands: cmd_tx,
        snapshot: snap_rx,
        process,
    }
}
