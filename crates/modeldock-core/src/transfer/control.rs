//! Cooperative stop signal for one running transfer.
//!
//! The owning state machine requests a stop (pause, cancel or shutdown); the
//! engine checks between chunk writes and also wakes while waiting for data.

use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Pause,
    Cancel,
    Shutdown,
}

/// Shared stop flag; clones observe the same request. The first request wins.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    reason: Arc<OnceLock<StopReason>>,
    cancel: CancellationToken,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the transfer to stop. Returns false if a stop was already requested.
    pub fn request(&self, reason: StopReason) -> bool {
        let set = self.reason.set(reason).is_ok();
        self.cancel.cancel();
        set
    }

    pub fn requested(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) -> StopReason {
        self.cancel.cancelled().await;
        // The reason is recorded before the token is cancelled.
        self.requested().unwrap_or(StopReason::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_request_wins() {
        let t = StopToken::new();
        assert_eq!(t.requested(), None);
        assert!(t.request(StopReason::Pause));
        assert!(!t.request(StopReason::Cancel));
        assert_eq!(t.requested(), Some(StopReason::Pause));
    }

    #[tokio::test]
    async fn stopped_wakes_waiter() {
        let t = StopToken::new();
        let t2 = t.clone();
        let waiter = tokio::spawn(async move { t2.stopped().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.request(StopReason::Cancel);
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Cancel);
    }

    #[tokio::test]
    async fn stopped_returns_immediately_when_already_requested() {
        let t = StopToken::new();
        t.request(StopReason::Shutdown);
        assert_eq!(t.stopped().await, StopReason::Shutdown);
    }
}
