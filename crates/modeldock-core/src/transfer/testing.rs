//! In-memory range source for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::source::{ChunkStream, RangeSource, SourceInfo};
use crate::retry::TransferError;

pub(crate) struct MemorySource {
    data: Bytes,
    chunk: usize,
    delay: Duration,
    ranges: bool,
    missing: bool,
    failing_opens: AtomicU32,
    opened_at: Mutex<Vec<u64>>,
}

impl MemorySource {
    pub(crate) fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            chunk: 1024,
            delay: Duration::ZERO,
            ranges: true,
            missing: false,
            failing_opens: AtomicU32::new(0),
            opened_at: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    pub(crate) fn chunk_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    pub(crate) fn missing(mut self) -> Self {
        self.missing = true;
        self
    }

    /// The first `n` opens answer 503.
    pub(crate) fn failing_opens(self, n: u32) -> Self {
        self.failing_opens.store(n, Ordering::SeqCst);
        self
    }

    /// Offsets requested by every `open`, in order.
    pub(crate) fn opened_at(&self) -> Vec<u64> {
        self.opened_at.lock().clone()
    }
}

#[async_trait]
impl RangeSource for MemorySource {
    async fn probe(&self, _url: &str) -> Result<SourceInfo, TransferError> {
        if self.missing {
            return Err(TransferError::NotFound(404));
        }
        Ok(SourceInfo {
            content_length: Some(self.data.len() as u64),
            accept_ranges: self.ranges,
            ..SourceInfo::default()
        })
    }

    async fn open(&self, _url: &str, offset: u64) -> Result<Box<dyn ChunkStream>, TransferError> {
        self.opened_at.lock().push(offset);
        if self.missing {
            return Err(TransferError::NotFound(404));
        }
        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransferError::Http(503));
        }
        let start = if self.ranges {
            (offset as usize).min(self.data.len())
        } else {
            0
        };
        Ok(Box::new(MemoryStream {
            data: self.data.clone(),
            start: start as u64,
            pos: start,
            chunk: self.chunk,
            delay: self.delay,
        }))
    }
}

struct MemoryStream {
    data: Bytes,
    start: u64,
    pos: usize,
    chunk: usize,
    delay: Duration,
}

#[async_trait]
impl ChunkStream for MemoryStream {
    fn start_offset(&self) -> u64 {
        self.start
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let end = (self.pos + self.chunk).min(self.data.len());
        let chunk = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(Some(chunk))
    }
}
