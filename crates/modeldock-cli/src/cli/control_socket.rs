//! Control socket: server (during `modeldock serve`) and client (every other command).
//! Protocol: one JSON object per line each way, see `modeldock_core::control`.

use anyhow::{bail, Context, Result};
use modeldock_core::control::{handle_request, Reply, Request};
use modeldock_core::events::Envelope;
use modeldock_core::Orchestrator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

/// Binds `path` (replacing a stale socket) and serves clients until aborted.
pub fn spawn_control_listener(
    orch: Arc<Orchestrator>,
    path: impl AsRef<Path>,
) -> Result<tokio::task::JoinHandle<()>> {
    let path = path.as_ref().to_path_buf();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create socket dir {}", dir.display()))?;
    }
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("bind control socket {}", path.display()))?;
    tracing::info!(path = %path.display(), "control socket listening");

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(serve_client(Arc::clone(&orch), stream));
                }
                Err(e) => tracing::debug!("control socket accept: {}", e),
            }
        }
    });
    Ok(handle)
}

/// One client: requests are answered in order, and events for the client's
/// subscriptions are written between replies as they arrive.
async fn serve_client(orch: Arc<Orchestrator>, stream: UnixStream) {
    let mut events = orch.hub().connect();
    let connection = events.id();
    tracing::debug!(connection, "control client connected");

    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut hub_open = true;
    loop {
        let reply = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<Request>(&line) {
                    Ok(request) => handle_request(&orch, connection, request).await,
                    Err(e) => Reply::Error {
                        error: "bad_request".to_string(),
                        message: e.to_string(),
                    },
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(connection, "control socket read: {}", e);
                    break;
                }
            },
            next = events.recv(), if hub_open => match next {
                Some(envelope) => Reply::Event { envelope },
                None => {
                    hub_open = false;
                    continue;
                }
            },
        };
        if let Err(e) = write_line(&mut write, &reply).await {
            tracing::debug!(connection, "control socket write: {}", e);
            break;
        }
    }
    // Dropping `events` unsubscribes this client from every channel.
    tracing::debug!(connection, "control client disconnected");
}

pub async fn write_line<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    w.write_all(&buf).await?;
    w.flush().await
}

/// Client side of the control socket.
pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.with_context(|| {
            format!(
                "connect to {} (is `modeldock serve` running?)",
                path.display()
            )
        })?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        write_line(&mut self.write, request)
            .await
            .context("send request")
    }

    /// Next line from the daemon; `None` once it closed the connection.
    pub async fn next_reply(&mut self) -> Result<Option<Reply>> {
        loop {
            let Some(line) = self.lines.next_line().await.context("read reply")? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            let reply = serde_json::from_str(&line)
                .with_context(|| format!("malformed reply: {line}"))?;
            return Ok(Some(reply));
        }
    }

    /// Next event, skipping command replies.
    pub async fn next_event(&mut self) -> Result<Option<Envelope>> {
        while let Some(reply) = self.next_reply().await? {
            if let Reply::Event { envelope } = reply {
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }

    /// Send one request and wait for its reply. Events arriving meanwhile are dropped.
    pub async fn call(&mut self, request: &Request) -> Result<Value> {
        self.send(request).await?;
        loop {
            match self.next_reply().await? {
                Some(Reply::Ok { data }) => return Ok(data),
                Some(Reply::Error { error, message }) => bail!("{message} ({error})"),
                Some(Reply::Event { .. }) => continue,
                None => bail!("daemon closed the connection"),
            }
        }
    }

    pub async fn call_as<T: DeserializeOwned>(&mut self, request: &Request) -> Result<T> {
        let data = self.call(request).await?;
        serde_json::from_value(data).context("unexpected reply data")
    }
}
