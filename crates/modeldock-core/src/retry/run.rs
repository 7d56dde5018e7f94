//! Async retry loop whose backoff waits are interrupted by a stop request.

use std::future::Future;
use std::time::Duration;

use super::classify;
use super::error::TransferError;
use super::policy::{RetryDecision, RetryPolicy};
use crate::transfer::{StopReason, StopToken};

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Done(T),
    Failed(TransferError),
    Stopped(StopReason),
}

/// Sleep for a backoff delay. Returns the stop reason if one arrives first.
pub async fn backoff(delay: Duration, stop: &StopToken) -> Option<StopReason> {
    tokio::select! {
        reason = stop.stopped() => Some(reason),
        _ = tokio::time::sleep(delay) => None,
    }
}

/// Runs `f` until it succeeds, fails permanently, exhausts the policy, or is stopped.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    stop: &StopToken,
    what: &str,
    mut f: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 1u32;
    loop {
        if let Some(reason) = stop.requested() {
            return RetryOutcome::Stopped(reason);
        }
        match f(attempt).await {
            Ok(v) => return RetryOutcome::Done(v),
            Err(e) => match policy.decide(attempt, classify::classify(&e)) {
                RetryDecision::NoRetry => return RetryOutcome::Failed(e),
                RetryDecision::RetryAfter(d) => {
                    tracing::warn!(attempt, delay_ms = d.as_millis() as u64, "{} failed: {}", what, e);
                    if let Some(reason) = backoff(d, stop).await {
                        return RetryOutcome::Stopped(reason);
                    }
                    attempt += 1;
                }
            },
        }
    }
}
