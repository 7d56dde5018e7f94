use std::collections::HashMap;

use crate::config::Threshold;
use crate::events::{Alert, AlertLevel};

/// Remembers the last alert level per resource and reports only changes.
#[derive(Debug, Default)]
pub struct ThresholdTracker {
    levels: HashMap<&'static str, AlertLevel>,
}

fn level_for(value: f64, threshold: Threshold) -> AlertLevel {
    if value >= threshold.critical {
        AlertLevel::Critical
    } else if value >= threshold.warning {
        AlertLevel::Warning
    } else {
        AlertLevel::Info
    }
}

impl ThresholdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// An alert when `resource` moved to a different level, `None` otherwise.
    /// Returning below the warning line yields an info alert.
    pub fn observe(&mut self, resource: &'static str, value: f64, threshold: Threshold) -> Option<Alert> {
        let level = level_for(value, threshold);
        let previous = self.levels.insert(resource, level).unwrap_or(AlertLevel::Info);
        if previous == level {
            return None;
        }
        let message = match level {
            AlertLevel::Info => format!("{resource} usage back to normal at {value:.1}%"),
            AlertLevel::Warning => format!(
                "{resource} usage at {value:.1}% (warning at {:.0}%)",
                threshold.warning
            ),
            AlertLevel::Critical => format!(
                "{resource} usage at {value:.1}% (critical at {:.0}%)",
                threshold.critical
            ),
        };
        Some(Alert::new(level, resource, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Threshold = Threshold {
        warning: 70.0,
        critical: 85.0,
    };

    #[test]
    fn alerts_only_on_level_change() {
        let mut tracker = ThresholdTracker::new();
        assert!(tracker.observe("cpu", 10.0, T).is_none());
        let a = tracker.observe("cpu", 72.0, T).unwrap();
        assert_eq!(a.level, AlertLevel::Warning);
        assert!(tracker.observe("cpu", 75.0, T).is_none());
        assert_eq!(tracker.observe("cpu", 90.0, T).unwrap().level, AlertLevel::Critical);
        let back = tracker.observe("cpu", 5.0, T).unwrap();
        assert_eq!(back.level, AlertLevel::Info);
        assert!(back.message.contains("back to normal"));
    }

    #[test]
    fn resources_are_tracked_independently() {
        let mut tracker = ThresholdTracker::new();
        assert!(tracker.observe("cpu", 80.0, T).is_some());
        assert!(tracker.observe("memory", 80.0, T).is_some());
        assert!(tracker.observe("cpu", 80.0, T).is_none());
    }
}
