use chrono::Utc;
use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::health::{HealthLoop, ProbeResult};
use super::process::{LaunchSpec, ProcessError, TerminateMode};
use super::{Command, DeploymentContext};
use crate::error::{OrchestratorError, Result};
use crate::events::{Alert, AlertLevel, DeploymentEvent};
use crate::scheduler::{Admission, Pool, SlotPermit};
use crate::types::{DeploymentSnapshot, DeploymentStatus, HealthStatus, NetworkBinding};

pub(super) struct DeploymentActor {
    ctx: Arc<DeploymentContext>,
    snapshot: DeploymentSnapshot,
    model_path: Option<PathBuf>,
    published: watch::Sender<DeploymentSnapshot>,
    permit: Option<SlotPermit>,
    waiting: Option<oneshot::Receiver<SlotPermit>>,
    health: Option<HealthLoop>,
}

async fn next_probe(health: &mut Option<HealthLoop>) -> Option<ProbeResult> {
    match health {
        Some(h) => h.results.recv().await,
        None => pending().await,
    }
}

async fn next_grant(
    waiting: &mut Option<oneshot::Receiver<SlotPermit>>,
) -> std::result::Result<SlotPermit, oneshot::error::RecvError> {
    match waiting {
        Some(rx) => rx.await,
        None => pending().await,
    }
}

impl DeploymentActor {
    pub(super) fn new(
        ctx: Arc<DeploymentContext>,
        snapshot: DeploymentSnapshot,
        model_path: Option<PathBuf>,
        published: watch::Sender<DeploymentSnapshot>,
    ) -> Self {
        Self {
            ctx,
            snapshot,
            model_path,
            published,
            permit: None,
            waiting: None,
            health: None,
        }
    }

    /// Runs until shutdown. Stopped and failed deployments stay addressable
    /// because they can be started again.
    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, admission: Admission) {
        match admission {
            Admission::Dispatched(permit) => {
                self.permit = Some(permit);
                self.deploy_or_fail(None).await;
            }
            Admission::Queued(rx) => self.waiting = Some(rx),
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop(reply)) => {
                        let result = self.stop().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Restart(reply)) => {
                        let result = self.restart().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Start(reply)) => {
                        let result = self.start("start").await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                result = next_probe(&mut self.health) => match result {
                    Some(result) => self.on_probe(result),
                    None => self.health = None,
                },
                grant = next_grant(&mut self.waiting) => {
                    self.waiting = None;
                    match grant {
                        Ok(permit) => {
                            self.permit = Some(permit);
                            self.deploy_or_fail(None).await;
                        }
                        Err(_) => tracing::debug!(deployment_id = %self.snapshot.id, "queue entry dropped"),
                    }
                }
            }
        }
    }

    fn publish_snapshot(&self) {
        self.published.send_replace(self.snapshot.clone());
    }

    /// Apply one lifecycle edge. Entering `failed` is announced by
    /// `deployment_failed` alone, so no status event is sent for it.
    fn transition(&mut self, next: DeploymentStatus) -> bool {
        let from = self.snapshot.status;
        if !from.can_transition_to(next) {
            tracing::error!(deployment_id = %self.snapshot.id, %from, to = %next, "illegal deployment transition");
            return false;
        }
        self.snapshot.status = next;
        self.snapshot.updated_at = Utc::now();
        tracing::info!(deployment_id = %self.snapshot.id, name = %self.snapshot.name, %from, to = %next, "deployment transition");
        if next != DeploymentStatus::Failed {
            self.ctx.hub.publish(DeploymentEvent::StatusChanged {
                deployment_id: self.snapshot.id,
                from,
                to: next,
            });
        }
        true
    }

    fn set_health(&mut self, health: HealthStatus) {
        if self.snapshot.health == health {
            return;
        }
        self.snapshot.health = health;
        self.ctx.hub.publish(DeploymentEvent::HealthChanged {
            deployment_id: self.snapshot.id,
            health,
            consecutive_failures: self.snapshot.consecutive_probe_failures,
        });
    }

    fn release_binding(&mut self) {
        if let Some(binding) = self.snapshot.binding.take() {
            self.ctx.ports.release(binding.port);
        }
    }

    /// pending|stopped|failed -> deploying -> running. On error the caller
    /// fails the deployment, which also cleans up whatever was acquired.
    async fn deploy(&mut self) -> std::result::Result<(), String> {
        self.snapshot.error = None;
        if !self.transition(DeploymentStatus::Deploying) {
            return Err(format!("cannot deploy from {}", self.snapshot.status));
        }
        self.publish_snapshot();

        let host = self.snapshot.host.clone();
        let port = self
            .ctx
            .ports
            .allocate(&host, self.snapshot.preferred_port)
            .map_err(|e| e.to_string())?;
        let binding = NetworkBinding { host, port };
        self.snapshot.binding = Some(binding.clone());
        self.publish_snapshot();

        let spec = LaunchSpec {
            deployment_id: self.snapshot.id,
            model: self.snapshot.model.clone(),
            model_path: self.model_path.clone(),
            binding,
            limits: self.snapshot.limits.clone(),
        };
        let handle = self.ctx.process.launch(&spec).await.map_err(|e| e.to_string())?;
        self.snapshot.process = Some(handle.clone());
        self.publish_snapshot();

        let limit = self.ctx.settings.readiness_timeout;
        match tokio::time::timeout(limit, self.ctx.process.wait_ready(&handle)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(ProcessError::ReadinessTimeout(limit).to_string()),
        }

        self.transition(DeploymentStatus::Running);
        let now = Utc::now();
        self.snapshot.started_at = Some(now);
        self.snapshot.stopped_at = None;
        self.snapshot.consecutive_probe_failures = 0;
        self.snapshot.last_health_check = Some(now);
        self.set_health(HealthStatus::Healthy);
        self.publish_snapshot();
        self.health = Some(HealthLoop::spawn(
            self.ctx.process.clone(),
            handle,
            self.ctx.settings.probe_interval,
            self.ctx.settings.probe_timeout,
        ));
        Ok(())
    }

    async fn deploy_or_fail(&mut self, leg: Option<&str>) {
        if let Err(error) = self.deploy().await {
            let error = match leg {
                Some(leg) => format!("{leg}: {error}"),
                None => error,
            };
            self.fail(error).await;
        }
    }

    /// running -> stopping -> stopped. Graceful first, forced once the grace
    /// period runs out. The scheduler slot is left to the caller.
    async fn stop_process(&mut self) -> std::result::Result<(), String> {
        self.health = None;
        self.transition(DeploymentStatus::Stopping);
        self.publish_snapshot();

        if let Some(handle) = self.snapshot.process.clone() {
            let grace = self.ctx.settings.grace_period;
            let graceful = tokio::time::timeout(grace, self.ctx.process.terminate(&handle, TerminateMode::Graceful)).await;
            let needs_force = match graceful {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    tracing::warn!(deployment_id = %self.snapshot.id, "graceful stop failed: {}", e);
                    true
                }
                Err(_) => {
                    tracing::warn!(deployment_id = %self.snapshot.id, grace_secs = grace.as_secs(), "grace period elapsed, killing process");
                    true
                }
            };
            if needs_force {
                self.ctx
                    .process
                    .terminate(&handle, TerminateMode::Forced)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            self.snapshot.last_process = self.snapshot.process.take();
        }

        self.release_binding();
        self.transition(DeploymentStatus::Stopped);
        self.snapshot.stopped_at = Some(Utc::now());
        self.snapshot.consecutive_probe_failures = 0;
        self.set_health(HealthStatus::Unknown);
        self.publish_snapshot();
        Ok(())
    }

    async fn stop(&mut self) -> Result<DeploymentSnapshot> {
        if self.snapshot.status != DeploymentStatus::Running {
            return Err(OrchestratorError::invalid("stop", "deployment", self.snapshot.status));
        }
        match self.stop_process().await {
            Ok(()) => self.permit = None,
            Err(e) => self.fail(format!("stop failed: {e}")).await,
        }
        Ok(self.snapshot.clone())
    }

    async fn restart(&mut self) -> Result<DeploymentSnapshot> {
        match self.snapshot.status {
            DeploymentStatus::Running => {
                // The permit stays held across both legs.
                if let Err(e) = self.stop_process().await {
                    self.fail(format!("restart failed while stopping: {e}")).await;
                } else {
                    self.deploy_or_fail(Some("restart failed while starting")).await;
                }
                Ok(self.snapshot.clone())
            }
            DeploymentStatus::Stopped => self.start("restart").await,
            status => Err(OrchestratorError::invalid("restart", "deployment", status)),
        }
    }

    /// Redeploy from stopped or failed through the scheduler.
    async fn start(&mut self, command: &'static str) -> Result<DeploymentSnapshot> {
        let status = self.snapshot.status;
        if !matches!(status, DeploymentStatus::Stopped | DeploymentStatus::Failed) {
            return Err(OrchestratorError::invalid(command, "deployment", status));
        }
        if self.waiting.is_some() {
            return Ok(self.snapshot.clone());
        }
        match self
            .ctx
            .scheduler
            .admit(Pool::Deployment, self.snapshot.id, self.snapshot.priority)?
        {
            Admission::Dispatched(permit) => {
                self.permit = Some(permit);
                self.deploy_or_fail(None).await;
            }
            Admission::Queued(rx) => {
                tracing::info!(deployment_id = %self.snapshot.id, "start queued until a deployment slot frees");
                self.waiting = Some(rx);
            }
        }
        Ok(self.snapshot.clone())
    }

    fn on_probe(&mut self, result: ProbeResult) {
        if self.snapshot.status != DeploymentStatus::Running {
            return;
        }
        self.snapshot.last_health_check = Some(Utc::now());
        match result {
            Ok(()) => {
                self.snapshot.consecutive_probe_failures = 0;
                self.set_health(HealthStatus::Healthy);
            }
            Err(e) => {
                self.snapshot.consecutive_probe_failures += 1;
                let failures = self.snapshot.consecutive_probe_failures;
                tracing::debug!(deployment_id = %self.snapshot.id, failures, "health probe failed: {}", e);
                if failures >= self.ctx.settings.failure_threshold
                    && self.snapshot.health != HealthStatus::Unhealthy
                {
                    self.set_health(HealthStatus::Unhealthy);
                    tracing::warn!(deployment_id = %self.snapshot.id, failures, "deployment unhealthy");
                    self.ctx.hub.publish(
                        Alert::new(
                            AlertLevel::Warning,
                            "deployment",
                            format!("{} unhealthy after {} failed probes: {}", self.snapshot.name, failures, e),
                        )
                        .about(self.snapshot.id),
                    );
                }
            }
        }
        self.publish_snapshot();
    }

    /// Terminal failure of this run. Published exactly once per failure.
    async fn fail(&mut self, error: String) {
        self.health = None;
        if let Some(handle) = self.snapshot.process.take() {
            if let Err(e) = self.ctx.process.terminate(&handle, TerminateMode::Forced).await {
                tracing::warn!(deployment_id = %self.snapshot.id, "kill after failure: {}", e);
            }
            self.snapshot.last_process = Some(handle);
        }
        self.release_binding();
        self.permit = None;
        if !self.transition(DeploymentStatus::Failed) {
            return;
        }
        self.snapshot.error = Some(error.clone());
        self.snapshot.health = HealthStatus::Unknown;
        self.snapshot.stopped_at = Some(Utc::now());
        self.publish_snapshot();
        tracing::warn!(deployment_id = %self.snapshot.id, "deployment failed: {}", error);
        self.ctx.hub.publish(DeploymentEvent::DeploymentFailed {
            deployment_id: self.snapshot.id,
            error: error.clone(),
        });
        self.ctx.hub.publish(
            Alert::new(
                AlertLevel::Critical,
                "deployment",
                format!("{} failed: {}", self.snapshot.name, error),
            )
            .about(self.snapshot.id),
        );
    }

    async fn shutdown(&mut self) {
        if self.waiting.take().is_some() {
            self.ctx.scheduler.withdraw(Pool::Deployment, self.snapshot.id);
        }
        if self.snapshot.status == DeploymentStatus::Running {
            if let Err(e) = self.stop_process().await {
                self.fail(format!("stop failed: {e}")).await;
            }
        }
        self.permit = None;
    }
}
