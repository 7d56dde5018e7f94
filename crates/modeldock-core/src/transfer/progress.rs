//! Transfer rate and progress-event cadence.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling average of bytes per second over a fixed window.
#[derive(Debug)]
pub struct RateMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(100)),
            samples: VecDeque::new(),
        }
    }

    /// Record that `bytes` arrived at `now`.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the samples in the window (0 with fewer than two samples).
    pub fn bytes_per_sec(&self, now: Instant) -> f64 {
        let Some(&(first, _)) = self.samples.front() else {
            return 0.0;
        };
        let elapsed = now.duration_since(first).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let bytes: u64 = self.samples.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / elapsed
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Bounds progress events: at most one per interval, or earlier once enough
/// bytes arrived, whichever comes first.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    byte_threshold: u64,
    last_emit: Option<Instant>,
    bytes_since: u64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, byte_threshold: u64) -> Self {
        Self {
            interval,
            byte_threshold: byte_threshold.max(1),
            last_emit: None,
            bytes_since: 0,
        }
    }

    /// Account `bytes` and report whether an event should go out now.
    pub fn should_emit(&mut self, now: Instant, bytes: u64) -> bool {
        self.bytes_since += bytes;
        let due = match self.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if due || self.bytes_since >= self.byte_threshold {
            self.last_emit = Some(now);
            self.bytes_since = 0;
            true
        } else {
            false
        }
    }
}
