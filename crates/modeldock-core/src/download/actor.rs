use chrono::Utc;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::{Command, DownloadContext, DownloadStart};
use crate::catalog::ModelDescriptor;
use crate::error::{OrchestratorError, Result};
use crate::events::{ActivityEvent, Alert, AlertLevel};
use crate::retry::TransferError;
use crate::scheduler::{Admission, Pool, SlotPermit};
use crate::storage::{temp_path, Reservation};
use crate::store::StoredDownload;
use crate::transfer::{StopReason, StopToken, TransferEvent, TransferJob, TransferOutcome};
use crate::types::{DownloadSnapshot, DownloadStatus};

struct Running {
    stop: StopToken,
    events: mpsc::UnboundedReceiver<TransferEvent>,
}

pub(super) struct DownloadActor {
    ctx: Arc<DownloadContext>,
    snapshot: DownloadSnapshot,
    descriptor: ModelDescriptor,
    reservation: Option<Reservation>,
    published: watch::Sender<DownloadSnapshot>,
    permit: Option<SlotPermit>,
    /// Queued in the scheduler; yields the permit on dispatch.
    waiting: Option<oneshot::Receiver<SlotPermit>>,
    transfer: Option<Running>,
}

async fn next_event(transfer: &mut Option<Running>) -> Option<TransferEvent> {
    match transfer {
        Some(running) => running.events.recv().await,
        None => pending().await,
    }
}

async fn next_grant(
    waiting: &mut Option<oneshot::Receiver<SlotPermit>>,
) -> std::result::Result<SlotPermit, oneshot::error::RecvError> {
    match waiting {
        Some(rx) => rx.await,
        None => pending().await,
    }
}

impl DownloadActor {
    pub(super) fn new(
        ctx: Arc<DownloadContext>,
        snapshot: DownloadSnapshot,
        descriptor: ModelDescriptor,
        reservation: Option<Reservation>,
        published: watch::Sender<DownloadSnapshot>,
    ) -> Self {
        Self {
            ctx,
            snapshot,
            descriptor,
            reservation,
            published,
            permit: None,
            waiting: None,
            transfer: None,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, start: DownloadStart) {
        match start {
            DownloadStart::Admitted(Admission::Dispatched(permit)) => {
                self.announce_queued();
                self.permit = Some(permit);
                // A failure is already recorded on the snapshot.
                let _ = self.start_transfer().await;
            }
            DownloadStart::Admitted(Admission::Queued(rx)) => {
                self.announce_queued();
                self.waiting = Some(rx);
                self.persist().await;
            }
            DownloadStart::Paused => {}
        }

        while !self.snapshot.status.is_terminal() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Pause(reply)) => {
                        let result = self.pause().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Resume(reply)) => {
                        let result = self.resume().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Cancel(reply)) => {
                        let result = self.cancel().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                event = next_event(&mut self.transfer) => self.on_transfer_event(event).await,
                grant = next_grant(&mut self.waiting) => {
                    self.waiting = None;
                    match grant {
                        Ok(permit) => {
                            self.permit = Some(permit);
                            if let Err(e) = self.start_transfer().await {
                                self.refused_after_queue(e);
                            }
                        }
                        Err(_) => tracing::debug!(task_id = %self.snapshot.id, "queue entry dropped"),
                    }
                }
            }
        }
        tracing::debug!(task_id = %self.snapshot.id, status = %self.snapshot.status, "download actor finished");
    }

    /// A queued resume found no space once its slot came up. Nobody is
    /// waiting on a reply any more, so the refusal goes out as an alert.
    fn refused_after_queue(&self, error: OrchestratorError) {
        if self.snapshot.status != DownloadStatus::Paused {
            return;
        }
        self.ctx.hub.publish(
            Alert::new(
                AlertLevel::Warning,
                "download",
                format!("download of {} stays paused: {}", self.snapshot.model, error),
            )
            .about(self.snapshot.id),
        );
    }

    fn announce_queued(&self) {
        self.ctx.hub.publish(ActivityEvent::DownloadQueued {
            task_id: self.snapshot.id,
            model: self.snapshot.model.clone(),
            priority: self.snapshot.priority,
        });
    }

    fn set_status(&mut self, next: DownloadStatus) {
        let from = self.snapshot.status;
        if !from.can_transition_to(next) {
            tracing::error!(task_id = %self.snapshot.id, %from, to = %next, "illegal download transition");
            return;
        }
        self.snapshot.status = next;
        self.snapshot.updated_at = Utc::now();
        tracing::info!(task_id = %self.snapshot.id, model = %self.snapshot.model, %from, to = %next, "download transition");
    }

    fn publish_snapshot(&self) {
        self.published.send_replace(self.snapshot.clone());
    }

    async fn persist(&self) {
        let record = StoredDownload {
            snapshot: self.snapshot.clone(),
            descriptor: Some(self.descriptor.clone()),
        };
        if let Err(e) = self.ctx.store.save(&record).await {
            tracing::warn!(task_id = %self.snapshot.id, "persist download: {:#}", e);
        }
    }

    /// Launch one engine run from the persisted offset. A paused task that
    /// cannot get its space back stays paused and gives up its slot.
    async fn start_transfer(&mut self) -> Result<()> {
        let reservation = match self.reservation.clone() {
            Some(r) => r,
            None => {
                let size = self
                    .snapshot
                    .total_bytes
                    .or(self.descriptor.expected_size)
                    .unwrap_or(0);
                match self
                    .ctx
                    .storage
                    .reserve_resume(&self.snapshot.model, &self.descriptor.file_name, size)
                {
                    Ok(r) => {
                        self.reservation = Some(r.clone());
                        r
                    }
                    Err(e) if self.snapshot.status == DownloadStatus::Paused => {
                        self.permit = None;
                        tracing::warn!(task_id = %self.snapshot.id, "resume refused: {}", e);
                        return Err(e.into());
                    }
                    Err(e) => {
                        let err = OrchestratorError::from(e);
                        self.fail(err.to_string()).await;
                        return Err(err);
                    }
                }
            }
        };

        let resuming = self.snapshot.status == DownloadStatus::Paused;
        let offset = self.snapshot.bytes_transferred;
        let job = TransferJob {
            task_id: self.snapshot.id,
            url: self.descriptor.url.clone(),
            reservation: reservation.clone(),
            offset,
            total: self.snapshot.total_bytes.or(self.descriptor.expected_size),
            expected_sha256: self.descriptor.sha256.clone(),
        };
        let stop = StopToken::new();
        let events = self.ctx.engine.spawn(job, stop.clone());
        self.transfer = Some(Running { stop, events });

        self.set_status(DownloadStatus::Downloading);
        self.snapshot.target_path = Some(reservation.target.clone());
        if self.snapshot.started_at.is_none() {
            self.snapshot.started_at = Some(Utc::now());
        }
        self.publish_snapshot();
        self.persist().await;
        let event = if resuming {
            ActivityEvent::DownloadResumed {
                task_id: self.snapshot.id,
                offset,
            }
        } else {
            ActivityEvent::DownloadStarted {
                task_id: self.snapshot.id,
                model: self.snapshot.model.clone(),
                offset,
            }
        };
        self.ctx.hub.publish(event);
        Ok(())
    }

    async fn on_transfer_event(&mut self, event: Option<TransferEvent>) {
        match event {
            Some(TransferEvent::Finished(outcome)) => {
                self.transfer = None;
                self.on_outcome(outcome).await;
            }
            Some(other) => self.on_progress(other).await,
            None => {
                self.transfer = None;
                self.fail(TransferError::Disconnected.to_string()).await;
            }
        }
    }

    async fn on_progress(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Probed { total } => {
                self.snapshot.total_bytes = total;
                self.snapshot.progress = self.snapshot.fraction();
                self.publish_snapshot();
                self.persist().await;
            }
            TransferEvent::Restarted { reason } => {
                self.snapshot.restarts += 1;
                self.snapshot.bytes_transferred = 0;
                self.snapshot.progress = 0.0;
                self.snapshot.updated_at = Utc::now();
                self.publish_snapshot();
                self.persist().await;
                tracing::warn!(task_id = %self.snapshot.id, restarts = self.snapshot.restarts, "transfer restarted: {}", reason);
                self.ctx.hub.publish(ActivityEvent::TransferRestarted {
                    task_id: self.snapshot.id,
                    reason,
                });
            }
            TransferEvent::Progress { bytes, total, rate } => {
                if total.is_some() {
                    self.snapshot.total_bytes = total;
                }
                self.snapshot.bytes_transferred = bytes;
                self.snapshot.rate_bytes_per_sec = rate;
                self.snapshot.progress = self.snapshot.fraction();
                self.snapshot.updated_at = Utc::now();
                self.publish_snapshot();
                self.persist().await;
                self.ctx.hub.publish(ActivityEvent::DownloadProgress {
                    task_id: self.snapshot.id,
                    bytes_transferred: bytes,
                    total_bytes: self.snapshot.total_bytes,
                    progress: self.snapshot.progress,
                    rate_bytes_per_sec: rate,
                });
            }
            TransferEvent::Finished(_) => {}
        }
    }

    async fn on_outcome(&mut self, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::Completed { path, bytes } => {
                self.permit = None;
                if let Some(r) = self.reservation.take() {
                    self.ctx.storage.release(&r);
                }
                self.set_status(DownloadStatus::Completed);
                self.snapshot.bytes_transferred = bytes;
                self.snapshot.total_bytes = Some(bytes);
                self.snapshot.progress = 1.0;
                self.snapshot.rate_bytes_per_sec = 0.0;
                self.snapshot.target_path = Some(path.clone());
                self.snapshot.completed_at = Some(Utc::now());
                self.publish_snapshot();
                self.persist().await;
                self.ctx.hub.publish(ActivityEvent::DownloadCompleted {
                    task_id: self.snapshot.id,
                    path,
                    bytes,
                });
            }
            TransferOutcome::Stopped { offset, .. } => self.settle_paused(offset).await,
            TransferOutcome::Failed { error, offset } => {
                self.snapshot.bytes_transferred = offset;
                self.fail(error.to_string()).await;
            }
        }
    }

    /// Stop the running transfer and wait for its outcome, applying any
    /// progress that arrives meanwhile.
    async fn stop_transfer(&mut self, reason: StopReason) -> Option<TransferOutcome> {
        let mut running = self.transfer.take()?;
        running.stop.request(reason);
        while let Some(event) = running.events.recv().await {
            match event {
                TransferEvent::Finished(outcome) => return Some(outcome),
                other => self.on_progress(other).await,
            }
        }
        Some(TransferOutcome::Failed {
            error: TransferError::Disconnected,
            offset: self.snapshot.bytes_transferred,
        })
    }

    async fn settle_paused(&mut self, offset: u64) {
        self.permit = None;
        self.set_status(DownloadStatus::Paused);
        self.snapshot.bytes_transferred = offset;
        self.snapshot.progress = self.snapshot.fraction();
        self.snapshot.rate_bytes_per_sec = 0.0;
        self.publish_snapshot();
        self.persist().await;
        self.ctx.hub.publish(ActivityEvent::DownloadPaused {
            task_id: self.snapshot.id,
            offset,
        });
    }

    async fn pause(&mut self) -> Result<DownloadSnapshot> {
        if self.snapshot.status != DownloadStatus::Downloading || self.transfer.is_none() {
            return Err(OrchestratorError::invalid("pause", "download", self.snapshot.status));
        }
        match self.stop_transfer(StopReason::Pause).await {
            Some(TransferOutcome::Stopped { offset, .. }) => {
                self.settle_paused(offset).await;
                Ok(self.snapshot.clone())
            }
            Some(outcome) => {
                // The transfer finished before it saw the pause.
                self.on_outcome(outcome).await;
                Err(OrchestratorError::invalid("pause", "download", self.snapshot.status))
            }
            None => Err(OrchestratorError::invalid("pause", "download", self.snapshot.status)),
        }
    }

    async fn resume(&mut self) -> Result<DownloadSnapshot> {
        if self.snapshot.status != DownloadStatus::Paused {
            return Err(OrchestratorError::invalid("resume", "download", self.snapshot.status));
        }
        if self.waiting.is_some() {
            return Ok(self.snapshot.clone());
        }
        match self
            .ctx
            .scheduler
            .admit(Pool::Download, self.snapshot.id, self.snapshot.priority)?
        {
            Admission::Dispatched(permit) => {
                self.permit = Some(permit);
                self.start_transfer().await?;
            }
            Admission::Queued(rx) => {
                tracing::info!(task_id = %self.snapshot.id, "resume queued until a transfer slot frees");
                self.waiting = Some(rx);
            }
        }
        Ok(self.snapshot.clone())
    }

    async fn cancel(&mut self) -> Result<DownloadSnapshot> {
        let status = self.snapshot.status;
        if !status.can_transition_to(DownloadStatus::Cancelled) {
            return Err(OrchestratorError::invalid("cancel", "download", status));
        }
        if let Some(outcome) = self.stop_transfer(StopReason::Cancel).await {
            if !matches!(outcome, TransferOutcome::Stopped { .. }) {
                // The transfer finished before it saw the cancel.
                self.on_outcome(outcome).await;
                return Err(OrchestratorError::invalid("cancel", "download", self.snapshot.status));
            }
        }
        if self.waiting.take().is_some() {
            self.ctx.scheduler.withdraw(Pool::Download, self.snapshot.id);
        }
        self.permit = None;
        self.discard_partial();

        self.set_status(DownloadStatus::Cancelled);
        self.snapshot.rate_bytes_per_sec = 0.0;
        self.publish_snapshot();
        self.persist().await;
        self.ctx.hub.publish(ActivityEvent::DownloadCancelled {
            task_id: self.snapshot.id,
        });
        Ok(self.snapshot.clone())
    }

    fn discard_partial(&mut self) {
        if let Some(r) = self.reservation.take() {
            self.ctx.storage.discard(&r);
            return;
        }
        if let Some(target) = &self.snapshot.target_path {
            let temp = temp_path(target);
            if let Err(e) = std::fs::remove_file(&temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %temp.display(), "remove partial file: {}", e);
                }
            }
        }
    }

    /// Terminal failure: recorded, persisted and published exactly once.
    async fn fail(&mut self, error: String) {
        self.permit = None;
        if let Some(r) = self.reservation.take() {
            // The partial file stays for diagnostics.
            self.ctx.storage.release(&r);
        }
        self.set_status(DownloadStatus::Failed);
        self.snapshot.error = Some(error.clone());
        self.snapshot.rate_bytes_per_sec = 0.0;
        self.snapshot.progress = self.snapshot.fraction();
        self.publish_snapshot();
        self.persist().await;
        tracing::warn!(task_id = %self.snapshot.id, "download failed: {}", error);
        self.ctx.hub.publish(ActivityEvent::DownloadFailed {
            task_id: self.snapshot.id,
            error: error.clone(),
        });
        self.ctx.hub.publish(
            Alert::new(
                AlertLevel::Warning,
                "download",
                format!("download of {} failed: {}", self.snapshot.model, error),
            )
            .about(self.snapshot.id),
        );
    }

    async fn shutdown(&mut self) {
        if let Some(outcome) = self.stop_transfer(StopReason::Shutdown).await {
            self.on_outcome(outcome).await;
        }
        if self.waiting.take().is_some() {
            self.ctx.scheduler.withdraw(Pool::Download, self.snapshot.id);
        }
        self.permit = None;
        if let Some(r) = self.reservation.take() {
            self.ctx.storage.release(&r);
        }
    }
}
