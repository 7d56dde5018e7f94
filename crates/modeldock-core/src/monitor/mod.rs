//! Periodic sampling for the `system-resources` and `model-status` channels,
//! plus threshold alerts on `system-alerts`.

mod procfs;
mod threshold;

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::events::{EventHub, ModelStatusSample, ResourceSample};
use crate::scheduler::{Pool, Scheduler};
use crate::storage::StorageManager;

pub use procfs::ProcfsResources;
pub use threshold::ThresholdTracker;

/// CPU and memory of the host at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostUsage {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
}

impl HostUsage {
    pub fn memory_percent(&self) -> f64 {
        percent(self.memory_used_bytes, self.memory_total_bytes)
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// Source of host resource samples.
pub trait ResourceProvider: Send + Sync {
    fn sample(&self) -> io::Result<HostUsage>;
}

/// Current per-model aggregate of downloads and deployments.
pub trait ModelStatusSource: Send + Sync {
    fn model_status(&self) -> ModelStatusSample;
}

pub struct Monitor {
    pub provider: Arc<dyn ResourceProvider>,
    pub status: Arc<dyn ModelStatusSource>,
    pub storage: Arc<StorageManager>,
    pub scheduler: Arc<Scheduler>,
    pub hub: EventHub,
    pub config: MonitorConfig,
}

/// Running monitor loop.
pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("monitor task ended abnormally: {}", e);
        }
    }
}

impl Monitor {
    /// Build one resource sample and the alerts it implies.
    pub fn sample(&self, tracker: &mut ThresholdTracker) -> ResourceSample {
        let mut sample = ResourceSample {
            active_downloads: self.scheduler.queue_status(Pool::Download).active_count,
            active_deployments: self.scheduler.queue_status(Pool::Deployment).active_count,
            ..ResourceSample::default()
        };
        match self.provider.sample() {
            Ok(host) => {
                sample.cpu_percent = host.cpu_percent;
                sample.memory_percent = host.memory_percent();
                sample.memory_used_bytes = host.memory_used_bytes;
                sample.memory_total_bytes = host.memory_total_bytes;
                self.alert(tracker.observe("cpu", sample.cpu_percent, self.config.cpu));
                self.alert(tracker.observe("memory", sample.memory_percent, self.config.memory));
            }
            Err(e) => tracing::debug!("host sample unavailable: {}", e),
        }
        match self.storage.usage() {
            Ok(usage) => {
                sample.disk_total_bytes = usage.total;
                sample.disk_used_bytes = usage.used;
                sample.disk_free_bytes = usage.free;
                sample.disk_reserved_bytes = usage.reserved;
                sample.disk_percent = percent(usage.used, usage.total);
                self.alert(tracker.observe("disk", sample.disk_percent, self.config.disk));
            }
            Err(e) => tracing::debug!("storage usage unavailable: {}", e),
        }
        sample
    }

    fn alert(&self, alert: Option<crate::events::Alert>) {
        if let Some(alert) = alert {
            tracing::warn!(source = %alert.source, level = ?alert.level, "{}", alert.message);
            self.hub.publish(alert);
        }
    }

    pub fn spawn(self) -> MonitorHandle {
        let (stop, mut stopped) = watch::channel(false);
        let interval = Duration::from_secs(self.config.sample_interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut tracker = ThresholdTracker::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                let sample = self.sample(&mut tracker);
                self.hub.publish(sample);
                self.hub.publish(self.status.model_status());
            }
            tracing::debug!("monitor stopped");
        });
        MonitorHandle { stop, task }
    }
}
