//! Download state machine.
//!
//! Each task runs as one actor task owning its record. Commands arrive over a
//! single-consumer channel and are applied in arrival order; observers read
//! the latest snapshot from a watch channel. The actor exits once the task is
//! terminal, after which every command is rejected as an invalid transition.

mod actor;

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::catalog::ModelDescriptor;
use crate::error::{OrchestratorError, Result};
use crate::events::EventHub;
use crate::scheduler::{Admission, Scheduler};
use crate::storage::{Reservation, StorageManager};
use crate::store::TaskStore;
use crate::transfer::TransferEngine;
use crate::types::{DownloadSnapshot, TaskId};
use actor::DownloadActor;

/// Collaborators shared by every download actor.
pub struct DownloadContext {
    pub engine: Arc<TransferEngine>,
    pub storage: Arc<StorageManager>,
    pub scheduler: Arc<Scheduler>,
    pub hub: EventHub,
    pub store: TaskStore,
}

/// How a new actor begins.
pub enum DownloadStart {
    /// Freshly admitted (or recovered while pending).
    Admitted(Admission),
    /// Recovered mid-transfer; waits for an explicit resume.
    Paused,
}

type Reply = oneshot::Sender<Result<DownloadSnapshot>>;

enum Command {
    Pause(Reply),
    Resume(Reply),
    Cancel(Reply),
    /// Stop any running transfer, persist its offset and exit.
    Shutdown(oneshot::Sender<()>),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Pause(_) => "pause",
            Command::Resume(_) => "resume",
            Command::Cancel(_) => "cancel",
            Command::Shutdown(_) => "shutdown",
        }
    }
}

/// Cheap, cloneable access to one download actor.
#[derive(Clone)]
pub struct DownloadHandle {
    id: TaskId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<DownloadSnapshot>,
}

impl DownloadHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<DownloadSnapshot> {
        self.snapshot.clone()
    }

    /// Whether the actor is still accepting commands.
    pub fn is_active(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<DownloadSnapshot> {
        let (tx, rx) = oneshot::channel();
        let command = make(tx);
        let name = command.name();
        if self.commands.send(command).is_err() {
            return Err(self.rejected(name));
        }
        rx.await.unwrap_or_else(|_| Err(self.rejected(name)))
    }

    fn rejected(&self, command: &'static str) -> OrchestratorError {
        OrchestratorError::invalid(command, "download", self.snapshot.borrow().status)
    }

    pub async fn pause(&self) -> Result<DownloadSnapshot> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<DownloadSnapshot> {
        self.request(Command::Resume).await
    }

    pub async fn cancel(&self) -> Result<DownloadSnapshot> {
        self.request(Command::Cancel).await
    }

    /// Pause an active transfer for daemon shutdown. No-op once terminal.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start the actor for one task and return its handle.
pub fn spawn_download(
    ctx: Arc<DownloadContext>,
    snapshot: DownloadSnapshot,
    descriptor: ModelDescriptor,
    reservation: Option<Reservation>,
    start: DownloadStart,
) -> DownloadHandle {
    let id = snapshot.id;
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (snap_tx, snap_rx) = watch::channel(snapshot.clone());
    let actor = DownloadActor::new(ctx, snapshot, descriptor, reservation, snap_tx);
    tokio::spawn(actor.run(cmd_rx, start));
    DownloadHandle {
        id,
        commands: cmd_tx,
        snapshot: snap_rx,
    }
}
