//! Periodic health probing for one running process.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::process::{DeployableProcess, ProcessError};
use crate::types::ProcessHandle;

/// Result of one probe, delivered to the owning deployment actor.
pub(super) type ProbeResult = Result<(), ProcessError>;

/// Background probe task. Aborted when dropped.
pub(super) struct HealthLoop {
    task: JoinHandle<()>,
    pub(super) results: mpsc::Receiver<ProbeResult>,
}

impl HealthLoop {
    pub(super) fn spawn(
        process: Arc<dyn DeployableProcess>,
        handle: ProcessHandle,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let (tx, results) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; readiness was just confirmed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let result = match tokio::time::timeout(timeout, process.health_probe(&handle)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProcessError::ProbeTimeout(timeout)),
                };
                if tx.send(result).await.is_err() {
                    return;
                }
            }
        });
        Self { task, results }
    }
}

impl Drop for HealthLoop {
    fn drop(&mut self) {
        self.task.abort();
    }
}
