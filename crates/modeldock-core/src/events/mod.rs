//! Channel-scoped event broadcast.
//!
//! Five independent channels. Periodic channels keep only the latest sample
//! per connection; event-driven channels queue every event in emission order
//! for each subscribed connection.

mod hub;
mod payload;

pub use hub::{Connection, ConnectionId, EventHub};
pub use payload::{
    ActivityEvent, Alert, AlertLevel, DeploymentBrief, DeploymentEvent, DownloadBrief, Envelope,
    Event, ModelStatusEntry, ModelStatusSample, ResourceSample,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    SystemResources,
    ModelStatus,
    ActivityStream,
    SystemAlerts,
    DeploymentEvents,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::SystemResources,
        Channel::ModelStatus,
        Channel::ActivityStream,
        Channel::SystemAlerts,
        Channel::DeploymentEvents,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::SystemResources => "system-resources",
            Channel::ModelStatus => "model-status",
            Channel::ActivityStream => "activity-stream",
            Channel::SystemAlerts => "system-alerts",
            Channel::DeploymentEvents => "deployment-events",
        }
    }

    /// Fixed-interval samples with latest-value delivery.
    pub fn is_periodic(self) -> bool {
        matches!(self, Channel::SystemResources | Channel::ModelStatus)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown channel: {s}"))
    }
}
