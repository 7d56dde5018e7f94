//! The deployable-process capability the deployment state machine drives.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{DeploymentId, ModelRef, NetworkBinding, ProcessHandle, ResourceLimits};

/// Everything needed to launch one inference process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub deployment_id: DeploymentId,
    pub model: ModelRef,
    /// Local artifact when one was downloaded; otherwise the runtime resolves the model id.
    pub model_path: Option<PathBuf>,
    pub binding: NetworkBinding,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Ask the process to exit and wait for it.
    Graceful,
    /// Kill it outright.
    Forced,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("not ready within {}s", .0.as_secs())]
    ReadinessTimeout(Duration),
    #[error("process exited: {0}")]
    Exited(String),
    #[error("health probe failed: {0}")]
    Probe(String),
    #[error("health probe timed out after {}ms", .0.as_millis())]
    ProbeTimeout(Duration),
    #[error("terminate failed: {0}")]
    Terminate(String),
    #[error("unknown process {0}")]
    UnknownProcess(String),
}

#[async_trait]
pub trait DeployableProcess: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, ProcessError>;

    /// Resolves once the process serves requests. Callers bound it with a timeout.
    async fn wait_ready(&self, handle: &ProcessHandle) -> Result<(), ProcessError>;

    /// One health check. Callers bound it with a timeout.
    async fn health_probe(&self, handle: &ProcessHandle) -> Result<(), ProcessError>;

    /// Graceful waits for exit and may be abandoned by the caller after a grace period.
    async fn terminate(&self, handle: &ProcessHandle, mode: TerminateMode) -> Result<(), ProcessError>;

    /// The last `lines` lines of combined output, oldest first.
    async fn logs(&self, handle: &ProcessHandle, lines: usize) -> Result<Vec<String>, ProcessError>;

    /// Forget a process that is gone for good (its logs included).
    async fn release(&self, _handle: &ProcessHandle) {}
}
