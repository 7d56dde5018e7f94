//! Byte-range source abstraction consumed by the transfer engine.

use async_trait::async_trait;
use bytes::Bytes;

use crate::retry::TransferError;

/// Metadata learned from probing a source before fetching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    pub content_length: Option<u64>,
    /// Server advertised `Accept-Ranges: bytes`.
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// An open body stream.
#[async_trait]
pub trait ChunkStream: Send {
    /// Offset of the first byte this stream delivers. 0 when the server ignored the range.
    fn start_offset(&self) -> u64;

    /// Full artifact length when the response told us.
    fn total_len(&self) -> Option<u64>;

    /// Next chunk of body bytes; `None` at the end of the body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError>;
}

#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn probe(&self, url: &str) -> Result<SourceInfo, TransferError>;

    /// Start fetching from `offset`. Servers without range support answer from 0.
    async fn open(&self, url: &str, offset: u64) -> Result<Box<dyn ChunkStream>, TransferError>;
}
