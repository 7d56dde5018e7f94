//! Shared domain types: model references, task records and pagination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Download task identifier.
pub type TaskId = Uuid;
/// Deployment identifier.
pub type DeploymentId = Uuid;

/// Where a model artifact comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelSource {
    RemoteHub,
    LocalRuntime,
}

impl ModelSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelSource::RemoteHub => "remote-hub",
            ModelSource::LocalRuntime => "local-runtime",
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote-hub" | "hub" | "huggingface" => Ok(ModelSource::RemoteHub),
            "local-runtime" | "runtime" | "ollama" => Ok(ModelSource::LocalRuntime),
            other => Err(format!("unknown model source: {other}")),
        }
    }
}

/// Model identity plus source; `artifact` optionally names one file of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub id: String,
    pub source: ModelSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl ModelRef {
    pub fn new(id: impl Into<String>, source: ModelSource) -> Self {
        Self {
            id: id.into(),
            source,
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// Declared priority; higher dispatches first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// Edges of the download lifecycle graph.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Downloading, Paused)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Paused, Downloading)
                | (Paused, Cancelled)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "paused" => Ok(DownloadStatus::Paused),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            "cancelled" => Ok(DownloadStatus::Cancelled),
            other => Err(format!("unknown download status: {other}")),
        }
    }
}

/// Point-in-time view of one download task. The owning state machine is the only writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: TaskId,
    pub model: ModelRef,
    pub priority: Priority,
    pub status: DownloadStatus,
    /// Fraction in [0, 1]; 0 while the total is unknown.
    pub progress: f64,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    /// Rolling average in bytes per second.
    pub rate_bytes_per_sec: f64,
    pub target_path: Option<PathBuf>,
    pub error: Option<String>,
    /// Incremented whenever a transfer had to start over from byte 0.
    pub restarts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadSnapshot {
    pub fn new(id: TaskId, model: ModelRef, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id,
            model,
            priority,
            status: DownloadStatus::Pending,
            progress: 0.0,
            bytes_transferred: 0,
            total_bytes: None,
            rate_bytes_per_sec: 0.0,
            target_path: None,
            error: None,
            restarts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Fraction complete in [0.0, 1.0].
    pub fn fraction(&self) -> f64 {
        match self.total_bytes {
            Some(0) => 1.0,
            Some(total) => (self.bytes_transferred as f64 / total as f64).min(1.0),
            None => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopping => "stopping",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Stopped | DeploymentStatus::Failed)
    }

    /// Edges of the deployment lifecycle graph. `failed -> deploying` is an explicit redeploy.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Deploying)
                | (Pending, Failed)
                | (Deploying, Running)
                | (Deploying, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Stopped, Deploying)
                | (Failed, Deploying)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "deploying" => Ok(DeploymentStatus::Deploying),
            "running" => Ok(DeploymentStatus::Running),
            "stopping" => Ok(DeploymentStatus::Stopping),
            "stopped" => Ok(DeploymentStatus::Stopped),
            "failed" => Ok(DeploymentStatus::Failed),
            other => Err(format!("unknown deployment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host/port a deployment listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub host: String,
    pub port: u16,
}

impl NetworkBinding {
    /// Address a local client uses to reach the service.
    pub fn base_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            h => h,
        };
        format!("http://{}:{}", host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub gpu_device: Option<String>,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

/// Reference to a process owned by the deployable-process capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: String,
    pub binding: NetworkBinding,
}

/// Point-in-time view of one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    pub id: DeploymentId,
    pub model: ModelRef,
    pub name: String,
    pub priority: Priority,
    pub status: DeploymentStatus,
    pub health: HealthStatus,
    /// Requested host and optional preferred port.
    pub host: String,
    pub preferred_port: Option<u16>,
    /// Binding actually allocated while deploying/running.
    pub binding: Option<NetworkBinding>,
    pub limits: ResourceLimits,
    /// Present exactly while a process is live; the last one is kept for logs.
    pub process: Option<ProcessHandle>,
    pub last_process: Option<ProcessHandle>,
    pub consecutive_probe_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl DeploymentSnapshot {
    pub fn new(id: DeploymentId, model: ModelRef, name: impl Into<String>, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id,
            model,
            name: name.into(),
            priority,
            status: DeploymentStatus::Pending,
            health: HealthStatus::Unknown,
            host: "0.0.0.0".to_string(),
            preferred_port: None,
            binding: None,
            limits: ResourceLimits::default(),
            process: None,
            last_process: None,
            consecutive_probe_failures: 0,
            last_health_check: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        }
    }
}

/// Result of get-deployment-health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub id: DeploymentId,
    pub status: DeploymentStatus,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
}

/// 1-based page request. Page size is clamped to [1, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub const DEFAULT_PAGE_SIZE: usize = 20;
    pub const MAX_PAGE_SIZE: usize = 100;

    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    /// Slice an already filtered and ordered list.
    pub fn paginate(all: Vec<T>, req: PageRequest) -> Self {
        let req = PageRequest::new(req.page, req.page_size);
        let total = all.len();
        let total_pages = total.div_ceil(req.page_size);
        let start = (req.page - 1).saturating_mul(req.page_size);
        let items = all.into_iter().skip(start).take(req.page_size).collect();
        Self {
            items,
            page: req.page,
            page_size: req.page_size,
            total,
            total_pages,
        }
    }
}
