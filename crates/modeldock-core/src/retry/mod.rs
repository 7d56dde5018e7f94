//! Retry and backoff policy for transfers.
//!
//! Errors are classified into kinds (timeouts, throttling, connection
//! failures, server errors); only transient kinds are retried, with capped
//! exponential backoff. Backoff waits end early when the transfer is stopped.

mod classify;
mod error;
mod policy;
mod run;

pub use classify::{classify, classify_curl_error, classify_http_status};
pub use error::TransferError;
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
pub use run::{backoff, run_with_retry, RetryOutcome};
