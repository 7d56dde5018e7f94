//! Control protocol spoken over the daemon socket.
//!
//! One JSON object per line in each direction. Requests carry an `op` tag and
//! replies a `type` tag. Events for the connection's subscriptions arrive on
//! the same stream as `event` replies, interleaved with command replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::error::OrchestratorError;
use crate::events::{Channel, ConnectionId, Envelope};
use crate::orchestrator::{DeploymentRequest, DownloadRequest, Orchestrator};
use crate::scheduler::{Pool, QueueStatus};
use crate::types::{DeploymentId, DeploymentStatus, DownloadStatus, PageRequest, TaskId};

pub const DEFAULT_LOG_LINES: usize = 100;

fn default_log_lines() -> usize {
    DEFAULT_LOG_LINES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SubmitDownload(DownloadRequest),
    PauseDownload {
        id: TaskId,
    },
    ResumeDownload {
        id: TaskId,
    },
    CancelDownload {
        id: TaskId,
    },
    GetDownload {
        id: TaskId,
    },
    ListDownloads {
        #[serde(default)]
        status: Option<DownloadStatus>,
        #[serde(default)]
        page: Option<usize>,
        #[serde(default)]
        page_size: Option<usize>,
    },
    DeleteDownload {
        id: TaskId,
    },
    SubmitDeployment(DeploymentRequest),
    StopDeployment {
        id: DeploymentId,
    },
    RestartDeployment {
        id: DeploymentId,
    },
    StartDeployment {
        id: DeploymentId,
    },
    GetDeployment {
        id: DeploymentId,
    },
    ListDeployments {
        #[serde(default)]
        status: Option<DeploymentStatus>,
        #[serde(default)]
        page: Option<usize>,
        #[serde(default)]
        page_size: Option<usize>,
    },
    DeploymentLogs {
        id: DeploymentId,
        #[serde(default = "default_log_lines")]
        lines: usize,
    },
    DeploymentHealth {
        id: DeploymentId,
    },
    DeleteDeployment {
        id: DeploymentId,
    },
    QueueStatus,
    StorageUsage,
    Subscribe {
        channels: Vec<Channel>,
    },
    Unsubscribe {
        channels: Vec<Channel>,
    },
    SubscribeAll,
    UnsubscribeAll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        #[serde(default)]
        data: Value,
    },
    Error {
        /// Stable error kind, see [`OrchestratorError::kind`].
        error: String,
        message: String,
    },
    Event {
        envelope: Envelope,
    },
}

impl Reply {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Reply::Ok { data },
            Err(e) => Reply::Error {
                error: "encode".to_string(),
                message: e.to_string(),
            },
        }
    }

    pub fn failure(err: &OrchestratorError) -> Self {
        Reply::Error {
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Reply data of `queue_status`: both pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    pub download: QueueStatus,
    pub deployment: QueueStatus,
}

fn page(page: Option<usize>, page_size: Option<usize>) -> PageRequest {
    PageRequest::new(
        page.unwrap_or(1),
        page_size.unwrap_or(PageRequest::DEFAULT_PAGE_SIZE),
    )
}

/// Execute one request on behalf of `connection`.
///
/// Subscription requests act on the hub connection the caller registered for
/// this client; every other request goes straight to the orchestrator.
pub async fn handle_request(
    orch: &Orchestrator,
    connection: ConnectionId,
    request: Request,
) -> Reply {
    match dispatch(orch, connection, request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::debug!(connection, kind = e.kind(), "request rejected: {}", e);
            Reply::failure(&e)
        }
    }
}

async fn dispatch(
    orch: &Orchestrator,
    connection: ConnectionId,
    request: Request,
) -> Result<Reply, OrchestratorError> {
    let reply = match request {
        Request::SubmitDownload(req) => Reply::ok(orch.submit_download(req).await?),
        Request::PauseDownload { id } => Reply::ok(orch.pause_download(id).await?),
        Request::ResumeDownload { id } => Reply::ok(orch.resume_download(id).await?),
        Request::CancelDownload { id } => Reply::ok(orch.cancel_download(id).await?),
        Request::GetDownload { id } => Reply::ok(orch.get_download(id).await?),
        Request::ListDownloads {
            status,
            page: n,
            page_size,
        } => Reply::ok(orch.list_downloads(status, page(n, page_size)).await?),
        Request::DeleteDownload { id } => {
            orch.delete_download(id).await?;
            Reply::ok(Value::Null)
        }
        Request::SubmitDeployment(req) => Reply::ok(orch.submit_deployment(req).await?),
        Request::StopDeployment { id } => Reply::ok(orch.stop_deployment(id).await?),
        Request::RestartDeployment { id } => Reply::ok(orch.restart_deployment(id).await?),
        Request::StartDeployment { id } => Reply::ok(orch.start_deployment(id).await?),
        Request::GetDeployment { id } => Reply::ok(orch.get_deployment(id)?),
        Request::ListDeployments {
            status,
            page: n,
            page_size,
        } => Reply::ok(orch.list_deployments(status, page(n, page_size))),
        Request::DeploymentLogs { id, lines } => Reply::ok(orch.deployment_logs(id, lines).await?),
        Request::DeploymentHealth { id } => Reply::ok(orch.deployment_health(id)?),
        Request::DeleteDeployment { id } => {
            orch.delete_deployment(id).await?;
            Reply::ok(Value::Null)
        }
        Request::QueueStatus => Reply::ok(QueueReport {
            download: orch.queue_status(Pool::Download),
            deployment: orch.queue_status(Pool::Deployment),
        }),
        Request::StorageUsage => Reply::ok(orch.storage_usage()?),
        Request::Subscribe { channels } => {
            for channel in channels {
                if !orch.hub().subscribe(connection, channel) {
                    return Err(connection_gone(connection));
                }
            }
            Reply::ok(orch.hub().subscriptions(connection))
        }
        Request::Unsubscribe { channels } => {
            for channel in channels {
                orch.hub().unsubscribe(connection, channel);
            }
            Reply::ok(orch.hub().subscriptions(connection))
        }
        Request::SubscribeAll => {
            if !orch.hub().subscribe_all(connection) {
                return Err(connection_gone(connection));
            }
            Reply::ok(orch.hub().subscriptions(connection))
        }
        Request::UnsubscribeAll => {
            orch.hub().unsubscribe_all(connection);
            Reply::ok(Vec::<Channel>::new())
        }
    };
    Ok(reply)
}

fn connection_gone(connection: ConnectionId) -> OrchestratorError {
    OrchestratorError::NotFound {
        kind: "connection",
        id: connection.to_string(),
    }
}

/// Default path for the control socket, next to the task database.
pub fn default_control_socket_path() -> std::io::Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("modeldock")?;
    Ok(xdg_dirs
        .get_state_home()
        .join("modeldock")
        .join("control.sock"))
}
