//! Resumable fetch of one artifact into its storage reservation.
//!
//! The engine runs as its own tokio task and reports back over a channel; the
//! owning download state machine is the only consumer. Every run ends with
//! exactly one [`TransferEvent::Finished`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::control::{StopReason, StopToken};
use super::progress::{ProgressThrottle, RateMeter};
use super::source::RangeSource;
use crate::config::TransferConfig;
use crate::retry::{self, classify, RetryDecision, RetryOutcome, RetryPolicy, TransferError};
use crate::storage::{Reservation, StorageManager, StorageWriter};
use crate::types::TaskId;

const RANGE_UNSUPPORTED: &str = "source does not support range requests, restarted from byte 0";
const PARTIAL_MISSING: &str = "partial file missing, restarted from byte 0";

#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    pub stall_timeout: Duration,
    pub progress_interval: Duration,
    pub progress_bytes: u64,
    pub rate_window: Duration,
}

impl From<&TransferConfig> for TransferSettings {
    fn from(c: &TransferConfig) -> Self {
        Self {
            stall_timeout: Duration::from_secs(c.stall_timeout_secs.max(1)),
            progress_interval: Duration::from_millis(c.progress_interval_ms),
            progress_bytes: c.progress_bytes,
            rate_window: Duration::from_secs(c.rate_window_secs.max(1)),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

/// One execution of a transfer, starting at `offset`.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub task_id: TaskId,
    pub url: String,
    pub reservation: Reservation,
    pub offset: u64,
    /// Artifact length when already known (descriptor or an earlier run).
    pub total: Option<u64>,
    pub expected_sha256: Option<String>,
}

#[derive(Debug)]
pub enum TransferOutcome {
    /// Verified and renamed onto the target.
    Completed { path: PathBuf, bytes: u64 },
    /// Stopped on request; everything below `offset` is on disk.
    Stopped { offset: u64, reason: StopReason },
    Failed { error: TransferError, offset: u64 },
}

#[derive(Debug)]
pub enum TransferEvent {
    /// The artifact length became known.
    Probed { total: Option<u64> },
    /// The fetch went back to byte 0; a new transfer epoch begins.
    Restarted { reason: String },
    Progress {
        bytes: u64,
        total: Option<u64>,
        rate: f64,
    },
    Finished(TransferOutcome),
}

enum StreamEnd {
    Complete,
    Stopped(StopReason),
}

/// Mutable position of one run, shared across retry attempts.
struct Cursor {
    offset: u64,
    total: Option<u64>,
    meter: RateMeter,
    throttle: ProgressThrottle,
}

pub struct TransferEngine {
    source: Arc<dyn RangeSource>,
    storage: Arc<StorageManager>,
    policy: RetryPolicy,
    settings: TransferSettings,
}

impl TransferEngine {
    pub fn new(
        source: Arc<dyn RangeSource>,
        storage: Arc<StorageManager>,
        policy: RetryPolicy,
        settings: TransferSettings,
    ) -> Self {
        Self {
            source,
            storage,
            policy,
            settings,
        }
    }

    /// Run `job` on a new task. The receiver yields progress and then the outcome.
    pub fn spawn(
        self: &Arc<Self>,
        job: TransferJob,
        stop: StopToken,
    ) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = engine.run(&job, &stop, &tx).await;
            match &outcome {
                TransferOutcome::Completed { bytes, .. } => {
                    tracing::debug!(task_id = %job.task_id, bytes, "transfer completed")
                }
                TransferOutcome::Stopped { offset, reason } => {
                    tracing::debug!(task_id = %job.task_id, offset, ?reason, "transfer stopped")
                }
                TransferOutcome::Failed { error, offset } => {
                    tracing::debug!(task_id = %job.task_id, offset, "transfer failed: {}", error)
                }
            }
            let _ = tx.send(TransferEvent::Finished(outcome));
        });
        rx
    }

    async fn run(
        &self,
        job: &TransferJob,
        stop: &StopToken,
        tx: &mpsc::UnboundedSender<TransferEvent>,
    ) -> TransferOutcome {
        let mut total = job.total;
        if total.is_none() {
            let probed = retry::run_with_retry(&self.policy, stop, "probe", |_| {
                self.source.probe(&job.url)
            })
            .await;
            match probed {
                RetryOutcome::Done(info) => total = info.content_length,
                RetryOutcome::Stopped(reason) => {
                    return TransferOutcome::Stopped {
                        offset: job.offset,
                        reason,
                    }
                }
                RetryOutcome::Failed(error) => {
                    return TransferOutcome::Failed {
                        error,
                        offset: job.offset,
                    }
                }
            }
            if let Some(t) = total {
                if let Err(e) = self.storage.adjust(&job.reservation, t) {
                    return TransferOutcome::Failed {
                        error: e.into(),
                        offset: job.offset,
                    };
                }
                let _ = tx.send(TransferEvent::Probed { total });
            }
        }

        let mut cursor = Cursor {
            offset: job.offset,
            total,
            meter: RateMeter::new(self.settings.rate_window),
            throttle: ProgressThrottle::new(
                self.settings.progress_interval,
                self.settings.progress_bytes,
            ),
        };

        let writer = match self.open_writer(job, &mut cursor, tx) {
            Ok(w) => w,
            Err(error) => {
                return TransferOutcome::Failed {
                    error,
                    offset: cursor.offset,
                }
            }
        };

        let fetch_needed = match cursor.total {
            Some(t) => cursor.offset < t,
            None => true,
        };
        if fetch_needed {
            match self.fetch(job, &writer, &mut cursor, stop, tx).await {
                Ok(StreamEnd::Complete) => {}
                Ok(StreamEnd::Stopped(reason)) => {
                    if let Err(e) = writer.sync() {
                        tracing::warn!(task_id = %job.task_id, "sync on stop: {}", e);
                    }
                    return TransferOutcome::Stopped {
                        offset: cursor.offset,
                        reason,
                    };
                }
                Err(error) => {
                    return TransferOutcome::Failed {
                        error,
                        offset: cursor.offset,
                    }
                }
            }
        }

        let _ = tx.send(TransferEvent::Progress {
            bytes: cursor.offset,
            total: Some(cursor.offset),
            rate: cursor.meter.bytes_per_sec(Instant::now()),
        });
        match self
            .storage
            .finalize(
                &job.reservation,
                writer,
                cursor.offset,
                job.expected_sha256.as_deref(),
            )
            .await
        {
            Ok(path) => TransferOutcome::Completed {
                path,
                bytes: cursor.offset,
            },
            Err(e) => TransferOutcome::Failed {
                error: e.into(),
                offset: cursor.offset,
            },
        }
    }

    fn open_writer(
        &self,
        job: &TransferJob,
        cursor: &mut Cursor,
        tx: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<StorageWriter, TransferError> {
        if cursor.offset > 0 {
            match self
                .storage
                .open_writer(&job.reservation, cursor.offset, cursor.total)
            {
                Ok(w) => return Ok(w),
                Err(e) if e.is_not_found() => {
                    tracing::warn!(task_id = %job.task_id, offset = cursor.offset, "{}", PARTIAL_MISSING);
                    cursor.offset = 0;
                    let _ = tx.send(TransferEvent::Restarted {
                        reason: PARTIAL_MISSING.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self
            .storage
            .open_writer(&job.reservation, 0, cursor.total)?)
    }

    /// Stream until the body ends, retrying transient errors from the current offset.
    async fn fetch(
        &self,
        job: &TransferJob,
        writer: &StorageWriter,
        cursor: &mut Cursor,
        stop: &StopToken,
        tx: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<StreamEnd, TransferError> {
        let mut attempt = 1u32;
        loop {
            if let Some(reason) = stop.requested() {
                return Ok(StreamEnd::Stopped(reason));
            }
            let before = cursor.offset;
            let err = match self.stream_once(job, writer, cursor, stop, tx).await {
                Ok(end) => return Ok(end),
                Err(e) => e,
            };
            // Progress since the last failure earns a fresh attempt budget.
            if cursor.offset > before {
                attempt = 1;
            }
            match self.policy.decide(attempt, classify(&err)) {
                RetryDecision::NoRetry => return Err(err),
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        task_id = %job.task_id,
                        attempt,
                        offset = cursor.offset,
                        delay_ms = delay.as_millis() as u64,
                        "transfer interrupted: {}",
                        err
                    );
                    if let Some(reason) = retry::backoff(delay, stop).await {
                        return Ok(StreamEnd::Stopped(reason));
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn stream_once(
        &self,
        job: &TransferJob,
        writer: &StorageWriter,
        cursor: &mut Cursor,
        stop: &StopToken,
        tx: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<StreamEnd, TransferError> {
        let mut stream = self.source.open(&job.url, cursor.offset).await?;

        let start = stream.start_offset();
        if start != cursor.offset {
            if start != 0 {
                return Err(TransferError::RangeMismatch {
                    requested: cursor.offset,
                    actual: start,
                });
            }
            tracing::warn!(task_id = %job.task_id, offset = cursor.offset, "{}", RANGE_UNSUPPORTED);
            cursor.offset = 0;
            cursor.meter.reset();
            let _ = tx.send(TransferEvent::Restarted {
                reason: RANGE_UNSUPPORTED.to_string(),
            });
        }
        if cursor.total.is_none() {
            if let Some(t) = stream.total_len() {
                self.storage.adjust(&job.reservation, t)?;
                cursor.total = Some(t);
                let _ = tx.send(TransferEvent::Probed { total: Some(t) });
            }
        }

        loop {
            let next = tokio::select! {
                reason = stop.stopped() => return Ok(StreamEnd::Stopped(reason)),
                next = tokio::time::timeout(self.settings.stall_timeout, stream.next_chunk()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(TransferError::Stalled(self.settings.stall_timeout)),
                Ok(result) => result?,
            };
            let Some(bytes) = chunk else {
                break;
            };
            let len = bytes.len() as u64;
            if let Some(t) = cursor.total {
                if cursor.offset + len > t {
                    return Err(TransferError::Overrun { expected: t });
                }
            }
            self.storage.write_chunk(writer, cursor.offset, &bytes)?;
            cursor.offset += len;

            let now = Instant::now();
            cursor.meter.record(now, len);
            if cursor.throttle.should_emit(now, len) {
                let rate = cursor.meter.bytes_per_sec(now);
                tracing::debug!(task_id = %job.task_id, bytes = cursor.offset, total = ?cursor.total, rate, "progress");
                let _ = tx.send(TransferEvent::Progress {
                    bytes: cursor.offset,
                    total: cursor.total,
                    rate,
                });
            }
            if let Some(reason) = stop.requested() {
                return Ok(StreamEnd::Stopped(reason));
            }
        }

        if let Some(t) = cursor.total {
            if cursor.offset < t {
                return Err(TransferError::PartialTransfer {
                    expected: t,
                    received: cursor.offset,
                });
            }
        }
        Ok(StreamEnd::Complete)
    }
}
