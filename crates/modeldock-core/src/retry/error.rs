//! Transfer error type, classified for retry decisions.

use std::time::Duration;

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// libcurl reported an error (timeout, connection, etc.).
    #[error("{0}")]
    Curl(#[from] curl::Error),
    /// Source does not have the artifact (404/410).
    #[error("source not found (HTTP {0})")]
    NotFound(u32),
    /// Any other non-2xx response.
    #[error("HTTP {0}")]
    Http(u32),
    /// No bytes arrived within the stall bound.
    #[error("transfer stalled: no data for {}s", .0.as_secs())]
    Stalled(Duration),
    /// The body ended before the advertised length.
    #[error("partial transfer: expected {expected} bytes, got {received}")]
    PartialTransfer { expected: u64, received: u64 },
    /// The source sent more than the advertised length.
    #[error("source sent more than {expected} bytes")]
    Overrun { expected: u64 },
    /// The server answered a range request from an offset we did not ask for.
    #[error("requested offset {requested}, server answered from {actual}")]
    RangeMismatch { requested: u64, actual: u64 },
    /// The fetch worker went away without a result.
    #[error("transfer worker disconnected")]
    Disconnected,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TransferError {
    /// Map a non-2xx status to the matching variant.
    pub fn from_status(code: u32) -> Self {
        match code {
            404 | 410 => TransferError::NotFound(code),
            other => TransferError::Http(other),
        }
    }
}
