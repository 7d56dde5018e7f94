//! Resumable byte-range transfers: source abstraction, curl backend and the
//! engine that streams one artifact into storage.

mod control;
mod curl_source;
mod engine;
mod headers;
mod progress;
mod source;
#[cfg(test)]
pub(crate) mod testing;

pub use control::{StopReason, StopToken};
pub use curl_source::CurlSource;
pub use engine::{TransferEngine, TransferEvent, TransferJob, TransferOutcome, TransferSettings};
pub use progress::{ProgressThrottle, RateMeter};
pub use source::{ChunkStream, RangeSource, SourceInfo};
