use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

const GIB: u64 = 1024 * 1024 * 1024;

/// Retry policy parameters for transient transfer errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per transfer (including the first).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff (e.g. 0.25 = 250ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 0.25,
            max_delay_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_secs_f64(self.base_delay_secs.max(0.0)),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

/// Slot pools and queue bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Parallel transfer slots.
    pub max_active_downloads: usize,
    /// Concurrently deploying/running inference processes.
    pub max_active_deployments: usize,
    /// Maximum queued (not yet dispatched) entries per pool.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_downloads: 2,
            max_active_deployments: 1,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// No bytes within this bound counts as a stall (retried as transient).
    pub stall_timeout_secs: u64,
    /// Minimum spacing between progress events for one task.
    pub progress_interval_ms: u64,
    /// Emit a progress event early once this many bytes arrived since the last one.
    pub progress_bytes: u64,
    /// Window for the rolling transfer rate.
    pub rate_window_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: 60,
            progress_interval_ms: 500,
            progress_bytes: 8 * 1024 * 1024,
            rate_window_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub readiness_timeout_secs: u64,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Consecutive failed probes before health flips to unhealthy.
    pub failure_threshold: u32,
    /// Time allowed for graceful termination before a forced kill.
    pub grace_period_secs: u64,
    pub default_host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: 120,
            probe_interval_secs: 10,
            probe_timeout_secs: 5,
            failure_threshold: 3,
            grace_period_secs: 15,
            default_host: "0.0.0.0".to_string(),
            port_range_start: 8000,
            port_range_end: 9000,
        }
    }
}

/// Warning/critical percentages for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub sample_interval_secs: u64,
    pub cpu: Threshold,
    pub memory: Threshold,
    pub disk: Threshold,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            cpu: Threshold {
                warning: 70.0,
                critical: 85.0,
            },
            memory: Threshold {
                warning: 80.0,
                critical: 90.0,
            },
            disk: Threshold {
                warning: 80.0,
                critical: 90.0,
            },
        }
    }
}

/// Where model artifacts are fetched from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub hub_base_url: String,
    pub runtime_base_url: String,
    /// Artifact fetched when a model reference names none.
    pub default_artifact: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            hub_base_url: "https://huggingface.co".to_string(),
            runtime_base_url: "http://127.0.0.1:11434".to_string(),
            default_artifact: "model.safetensors".to_string(),
        }
    }
}

/// Inference process launched for each deployment.
///
/// `args` may contain `{model_path}`, `{model_id}`, `{host}` and `{port}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Path polled for readiness and health (`/api/tags` for ollama style servers).
    pub health_path: String,
    /// Log lines kept per process.
    pub log_lines: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: "vllm".to_string(),
            args: vec![
                "serve".to_string(),
                "{model_path}".to_string(),
                "--host".to_string(),
                "{host}".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            health_path: "/health".to_string(),
            log_lines: 1000,
        }
    }
}

/// Global configuration loaded from `~/.config/modeldock/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Root directory for downloaded artifacts. Defaults to the XDG data dir.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,
    /// Free space that reservations never eat into.
    pub min_free_bytes: u64,
    /// Optional cap on the bytes reserved by in-flight downloads.
    #[serde(default)]
    pub storage_quota_bytes: Option<u64>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Optional retry policy; if missing, built-in defaults are used.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            storage_root: None,
            min_free_bytes: GIB,
            storage_quota_bytes: None,
            scheduler: SchedulerConfig::default(),
            retry: None,
            transfer: TransferConfig::default(),
            deployment: DeploymentConfig::default(),
            monitor: MonitorConfig::default(),
            catalog: CatalogConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default().policy()
    }

    /// Configured storage root, or `~/.local/share/modeldock/models`.
    pub fn resolved_storage_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.storage_root {
            return Ok(root.clone());
        }
        let xdg_dirs = xdg::BaseDirectories::with_prefix("modeldock")?;
        Ok(xdg_dirs.get_data_home().join("models"))
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("modeldock")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<OrchestratorConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = OrchestratorConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: OrchestratorConfig = toml::from_str(&data)?;
    Ok(cfg)
}
