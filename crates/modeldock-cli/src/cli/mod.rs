//! CLI for the ModelDock orchestrator: the daemon (`serve`) and a control client.

mod commands;
mod control_socket;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modeldock_core::config;
use modeldock_core::events::Channel;
use modeldock_core::types::{
    DeploymentId, DeploymentStatus, DownloadStatus, ModelSource, Priority, TaskId,
};
use std::path::{Path, PathBuf};

use commands::{
    run_cancel, run_checksum, run_completions, run_deploy, run_deployments, run_download,
    run_downloads, run_health, run_logs, run_man, run_pause, run_queue, run_remove, run_restart,
    run_resume, run_serve, run_show, run_start, run_stop, run_storage, run_undeploy, run_watch,
};
use control_socket::ControlClient;

/// Top-level CLI for ModelDock.
#[derive(Debug, Parser)]
#[command(name = "modeldock")]
#[command(about = "ModelDock: download, deploy and watch local model servers", long_about = None)]
pub struct Cli {
    /// Control socket path (default: $XDG_STATE_HOME/modeldock/control.sock).
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the orchestrator daemon and its control socket until interrupted.
    Serve,

    /// Queue a model download.
    Download {
        /// Model identifier, e.g. `org/name`.
        model: String,
        /// Where the model comes from: hub or runtime.
        #[arg(long, default_value = "hub")]
        source: ModelSource,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// File within the model repository (default from config).
        #[arg(long, value_name = "FILE")]
        artifact: Option<String>,
    },

    /// Pause a downloading or queued download.
    Pause { id: TaskId },

    /// Resume a paused download.
    Resume { id: TaskId },

    /// Cancel a download and discard its partial file.
    Cancel { id: TaskId },

    /// Cancel if active, then forget a download.
    Remove { id: TaskId },

    /// List downloads, oldest first.
    Downloads {
        #[arg(long)]
        status: Option<DownloadStatus>,
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "20")]
        page_size: usize,
    },

    /// Show one download in full.
    Show { id: TaskId },

    /// Deploy a model as a local server.
    Deploy {
        model: String,
        #[arg(long, default_value = "hub")]
        source: ModelSource,
        /// Deployment name (default derived from the model).
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        host: Option<String>,
        /// Preferred port; another one from the configured range is used if taken.
        #[arg(long)]
        port: Option<u16>,
        /// GPU device to expose, e.g. `0`.
        #[arg(long)]
        gpu: Option<String>,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long, value_name = "MB")]
        memory_mb: Option<u64>,
        #[arg(long, default_value = "normal")]
        priority: Priority,
    },

    /// Stop a running deployment gracefully.
    Stop { id: DeploymentId },

    /// Restart a running or stopped deployment.
    Restart { id: DeploymentId },

    /// Deploy a stopped or failed deployment again.
    Start { id: DeploymentId },

    /// Stop if active, then forget a deployment.
    Undeploy { id: DeploymentId },

    /// List deployments.
    Deployments {
        #[arg(long)]
        status: Option<DeploymentStatus>,
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "20")]
        page_size: usize,
    },

    /// Print recent output of a deployment's process.
    Logs {
        id: DeploymentId,
        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
    },

    /// Show the health of a deployment.
    Health { id: DeploymentId },

    /// Show scheduler queues for downloads and deployments.
    Queue,

    /// Show storage usage of the model root.
    Storage,

    /// Subscribe to event channels and print every envelope as a JSON line.
    Watch {
        /// Channels to follow (all when none given).
        channels: Vec<Channel>,
    },

    /// Compute SHA-256 of a file (e.g. after download).
    Checksum {
        /// Path to the file.
        path: PathBuf,
    },

    /// Print shell completions to stdout.
    Completions { shell: clap_complete::Shell },

    /// Print the man page to stdout.
    Man,
}

fn socket_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p),
        None => modeldock_core::control::default_control_socket_path()
            .context("resolve control socket path"),
    }
}

async fn connect(socket: &Path) -> Result<ControlClient> {
    ControlClient::connect(socket).await
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let socket = socket_path(cli.socket)?;

        match cli.command {
            CliCommand::Serve => {
                let cfg = config::load_or_init()?;
                tracing::debug!("loaded config: {:?}", cfg);
                run_serve(cfg, &socket).await?;
            }
            CliCommand::Download {
                model,
                source,
                priority,
                artifact,
            } => {
                let mut client = connect(&socket).await?;
                run_download(&mut client, model, source, priority, artifact).await?;
            }
            CliCommand::Pause { id } => run_pause(&mut connect(&socket).await?, id).await?,
            CliCommand::Resume { id } => run_resume(&mut connect(&socket).await?, id).await?,
            CliCommand::Cancel { id } => run_cancel(&mut connect(&socket).await?, id).await?,
            CliCommand::Remove { id } => run_remove(&mut connect(&socket).await?, id).await?,
            CliCommand::Downloads {
                status,
                page,
                page_size,
            } => run_downloads(&mut connect(&socket).await?, status, page, page_size).await?,
            CliCommand::Show { id } => run_show(&mut connect(&socket).await?, id).await?,
            CliCommand::Deploy {
                model,
                source,
                name,
                host,
                port,
                gpu,
                cpus,
                memory_mb,
                priority,
            } => {
                let request = commands::deployment_request(
                    model, source, name, host, port, gpu, cpus, memory_mb, priority,
                );
                run_deploy(&mut connect(&socket).await?, request).await?;
            }
            CliCommand::Stop { id } => run_stop(&mut connect(&socket).await?, id).await?,
            CliCommand::Restart { id } => run_restart(&mut connect(&socket).await?, id).await?,
            CliCommand::Start { id } => run_start(&mut connect(&socket).await?, id).await?,
            CliCommand::Undeploy { id } => run_undeploy(&mut connect(&socket).await?, id).await?,
            CliCommand::Deployments {
                status,
                page,
                page_size,
            } => run_deployments(&mut connect(&socket).await?, status, page, page_size).await?,
            CliCommand::Logs { id, lines } => {
                run_logs(&mut connect(&socket).await?, id, lines).await?
            }
            CliCommand::Health { id } => run_health(&mut connect(&socket).await?, id).await?,
            CliCommand::Queue => run_queue(&mut connect(&socket).await?).await?,
            CliCommand::Storage => run_storage(&mut connect(&socket).await?).await?,
            CliCommand::Watch { channels } => {
                run_watch(&mut connect(&socket).await?, channels).await?
            }
            CliCommand::Checksum { path } => run_checksum(&path).await?,
            CliCommand::Completions { shell } => run_completions(shell)?,
            CliCommand::Man => run_man()?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
