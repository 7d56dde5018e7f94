//! Payload shapes, one enum variant per channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::Channel;
use crate::types::{
    DeploymentId, DeploymentStatus, DownloadStatus, HealthStatus, ModelRef, Priority, TaskId,
};

/// One sample of host resource usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_percent: f64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_free_bytes: u64,
    /// Storage bytes held by in-flight downloads.
    pub disk_reserved_bytes: u64,
    pub active_downloads: usize,
    pub active_deployments: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadBrief {
    pub id: TaskId,
    pub status: DownloadStatus,
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentBrief {
    pub id: DeploymentId,
    pub status: DeploymentStatus,
    pub health: HealthStatus,
}

/// Aggregate state of one model across its downloads and deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusEntry {
    pub model: ModelRef,
    pub downloads: Vec<DownloadBrief>,
    pub deployments: Vec<DeploymentBrief>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusSample {
    pub models: Vec<ModelStatusEntry>,
}

/// Download lifecycle and progress, in emission order per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    DownloadQueued {
        task_id: TaskId,
        model: ModelRef,
        priority: Priority,
    },
    DownloadStarted {
        task_id: TaskId,
        model: ModelRef,
        offset: u64,
    },
    DownloadProgress {
        task_id: TaskId,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
        progress: f64,
        rate_bytes_per_sec: f64,
    },
    DownloadPaused {
        task_id: TaskId,
        offset: u64,
    },
    DownloadResumed {
        task_id: TaskId,
        offset: u64,
    },
    /// The source could not continue from the saved offset; bytes restart at 0.
    TransferRestarted {
        task_id: TaskId,
        reason: String,
    },
    DownloadCompleted {
        task_id: TaskId,
        path: PathBuf,
        bytes: u64,
    },
    DownloadFailed {
        task_id: TaskId,
        error: String,
    },
    DownloadCancelled {
        task_id: TaskId,
    },
}

impl ActivityEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            ActivityEvent::DownloadQueued { task_id, .. }
            | ActivityEvent::DownloadStarted { task_id, .. }
            | ActivityEvent::DownloadProgress { task_id, .. }
            | ActivityEvent::DownloadPaused { task_id, .. }
            | ActivityEvent::DownloadResumed { task_id, .. }
            | ActivityEvent::TransferRestarted { task_id, .. }
            | ActivityEvent::DownloadCompleted { task_id, .. }
            | ActivityEvent::DownloadFailed { task_id, .. }
            | ActivityEvent::DownloadCancelled { task_id } => *task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    /// What raised it: `cpu`, `memory`, `disk`, `download` or `deployment`.
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<uuid::Uuid>,
}

impl Alert {
    pub fn new(level: AlertLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.into(),
            message: message.into(),
            subject: None,
        }
    }

    pub fn about(mut self, subject: uuid::Uuid) -> Self {
        self.subject = Some(subject);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentEvent {
    StatusChanged {
        deployment_id: DeploymentId,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
    HealthChanged {
        deployment_id: DeploymentId,
        health: HealthStatus,
        consecutive_failures: u32,
    },
    /// Published once per failure, never together with a `status_changed` to `failed`.
    DeploymentFailed {
        deployment_id: DeploymentId,
        error: String,
    },
}

impl DeploymentEvent {
    pub fn deployment_id(&self) -> DeploymentId {
        match self {
            DeploymentEvent::StatusChanged { deployment_id, .. }
            | DeploymentEvent::HealthChanged { deployment_id, .. }
            | DeploymentEvent::DeploymentFailed { deployment_id, .. } => *deployment_id,
        }
    }
}

/// A payload bound to its channel. The channel name is the serialized tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "payload")]
pub enum Event {
    #[serde(rename = "system-resources")]
    SystemResources(ResourceSample),
    #[serde(rename = "model-status")]
    ModelStatus(ModelStatusSample),
    #[serde(rename = "activity-stream")]
    Activity(ActivityEvent),
    #[serde(rename = "system-alerts")]
    Alert(Alert),
    #[serde(rename = "deployment-events")]
    Deployment(DeploymentEvent),
}

impl Event {
    pub fn channel(&self) -> Channel {
        match self {
            Event::SystemResources(_) => Channel::SystemResources,
            Event::ModelStatus(_) => Channel::ModelStatus,
            Event::Activity(_) => Channel::ActivityStream,
            Event::Alert(_) => Channel::SystemAlerts,
            Event::Deployment(_) => Channel::DeploymentEvents,
        }
    }
}

impl From<ResourceSample> for Event {
    fn from(v: ResourceSample) -> Self {
        Event::SystemResources(v)
    }
}

impl From<ModelStatusSample> for Event {
    fn from(v: ModelStatusSample) -> Self {
        Event::ModelStatus(v)
    }
}

impl From<ActivityEvent> for Event {
    fn from(v: ActivityEvent) -> Self {
        Event::Activity(v)
    }
}

impl From<Alert> for Event {
    fn from(v: Alert) -> Self {
        Event::Alert(v)
    }
}

impl From<DeploymentEvent> for Event {
    fn from(v: DeploymentEvent) -> Self {
        Event::Deployment(v)
    }
}

/// What a subscriber receives: `{"emitted_at", "channel", "payload"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    pub fn now(event: impl Into<Event>) -> Self {
        Self {
            emitted_at: Utc::now(),
            event: event.into(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.event.channel()
    }
}
