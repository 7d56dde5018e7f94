//! libcurl-backed range source.
//!
//! Each fetch runs one `Easy` handle on the blocking pool and streams frames
//! back over a bounded channel, so a slow consumer applies backpressure to
//! curl. Dropping the stream makes the next write callback abort the transfer.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use super::headers::{parse_head, ResponseHead};
use super::source::{ChunkStream, RangeSource, SourceInfo};
use crate::retry::TransferError;

const FRAME_BUFFER: usize = 32;

enum Frame {
    Head(ResponseHead),
    Data(Bytes),
    Done,
    Failed(TransferError),
}

#[derive(Debug, Clone)]
pub struct CurlSource {
    connect_timeout: Duration,
    stall_timeout: Duration,
}

impl CurlSource {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            stall_timeout,
        }
    }
}

#[async_trait]
impl RangeSource for CurlSource {
    async fn probe(&self, url: &str) -> Result<SourceInfo, TransferError> {
        let url = url.to_string();
        let connect_timeout = self.connect_timeout;
        tokio::task::spawn_blocking(move || probe_blocking(&url, connect_timeout))
            .await
            .map_err(|_| TransferError::Disconnected)?
    }

    async fn open(&self, url: &str, offset: u64) -> Result<Box<dyn ChunkStream>, TransferError> {
        let (tx, mut rx) = mpsc::channel(FRAME_BUFFER);
        let url = url.to_string();
        let (connect_timeout, stall_timeout) = (self.connect_timeout, self.stall_timeout);
        tokio::task::spawn_blocking(move || {
            fetch_blocking(&url, offset, connect_timeout, stall_timeout, tx)
        });

        let head = match rx.recv().await {
            Some(Frame::Head(head)) => head,
            Some(Frame::Failed(e)) => return Err(e),
            Some(_) | None => return Err(TransferError::Disconnected),
        };
        let (start, total) = match head.status {
            206 => match head.content_range {
                Some((start, total)) => (
                    start,
                    total.or(head.content_length.map(|len| start + len)),
                ),
                None => (offset, head.content_length.map(|len| offset + len)),
            },
            200..=299 => (0, head.content_length),
            other => return Err(TransferError::from_status(other)),
        };
        tracing::debug!(status = head.status, requested = offset, start, "range GET opened");
        Ok(Box::new(CurlStream {
            rx,
            start,
            total,
            finished: false,
        }))
    }
}

struct CurlStream {
    rx: mpsc::Receiver<Frame>,
    start: u64,
    total: Option<u64>,
    finished: bool,
}

#[async_trait]
impl ChunkStream for CurlStream {
    fn start_offset(&self) -> u64 {
        self.start
    }

    fn total_len(&self) -> Option<u64> {
        self.total
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.rx.recv().await {
                Some(Frame::Data(bytes)) => return Ok(Some(bytes)),
                Some(Frame::Done) => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(Frame::Failed(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                Some(Frame::Head(_)) => continue,
                None => return Err(TransferError::Disconnected),
            }
        }
    }
}

/// HEAD request. Servers that refuse HEAD yield empty metadata rather than an error.
fn probe_blocking(url: &str, connect_timeout: Duration) -> Result<SourceInfo, TransferError> {
    let mut lines: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.nobody(true)?;
    easy.follow_location(true)?;
    easy.connect_timeout(connect_timeout)?;
    easy.timeout(Duration::from_secs(60))?;
    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            lines.push(String::from_utf8_lossy(data).trim_end().to_string());
            true
        })?;
        transfer.perform()?;
    }

    let code = easy.response_code()?;
    match code {
        200..=299 => Ok(parse_head(&lines).info()),
        405 | 501 => {
            tracing::debug!(url, code, "HEAD not allowed, size unknown until GET");
            Ok(SourceInfo::default())
        }
        other => Err(TransferError::from_status(other)),
    }
}

fn fetch_blocking(
    url: &str,
    offset: u64,
    connect_timeout: Duration,
    stall_timeout: Duration,
    tx: mpsc::Sender<Frame>,
) {
    match perform_fetch(url, offset, connect_timeout, stall_timeout, &tx) {
        Ok(()) => {
            let _ = tx.blocking_send(Frame::Done);
        }
        Err(e) => {
            // A closed receiver means the stream was dropped on purpose.
            if !tx.is_closed() {
                let _ = tx.blocking_send(Frame::Failed(e));
            }
        }
    }
}

fn perform_fetch(
    url: &str,
    offset: u64,
    connect_timeout: Duration,
    stall_timeout: Duration,
    tx: &mpsc::Sender<Frame>,
) -> Result<(), TransferError> {
    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.connect_timeout(connect_timeout)?;
    // Abort when throughput stays below 1 byte/s for the stall window.
    easy.low_speed_limit(1)?;
    easy.low_speed_time(stall_timeout)?;
    if offset > 0 {
        easy.range(&format!("{}-", offset))?;
    }

    let mut lines: Vec<String> = Vec::new();
    let mut head: Option<ResponseHead> = None;
    let mut received = 0u64;
    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            let line = String::from_utf8_lossy(data).trim_end().to_string();
            if !line.is_empty() {
                lines.push(line);
                return true;
            }
            let parsed = parse_head(&lines);
            lines.clear();
            if parsed.is_redirect() {
                return true;
            }
            head = Some(parsed.clone());
            tx.blocking_send(Frame::Head(parsed)).is_ok()
        })?;
        transfer.write_function(|data| {
            received += data.len() as u64;
            match tx.blocking_send(Frame::Data(Bytes::copy_from_slice(data))) {
                Ok(()) => Ok(data.len()),
                Err(_) => Ok(0),
            }
        })?;
        transfer.perform()?;
    }

    let head = match head {
        Some(h) => h,
        None => {
            let code = easy.response_code()?;
            return Err(TransferError::from_status(code));
        }
    };
    if !(200..300).contains(&head.status) {
        return Err(TransferError::from_status(head.status));
    }
    if let Some(expected) = head.content_length {
        if received < expected {
            return Err(TransferError::PartialTransfer { expected, received });
        }
    }
    Ok(())
}
