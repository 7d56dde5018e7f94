//! `modeldock serve` – run the orchestrator with the control socket until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use modeldock_core::config::OrchestratorConfig;
use modeldock_core::Orchestrator;
use std::path::Path;
use std::sync::Arc;

use crate::cli::control_socket;

pub async fn run_serve(cfg: OrchestratorConfig, socket: &Path) -> Result<()> {
    let orch = Arc::new(Orchestrator::builder(cfg).build().await?);
    orch.start().await.context("recover persisted downloads")?;
    let listener = control_socket::spawn_control_listener(Arc::clone(&orch), socket)?;
    println!("modeldock serving on {}", socket.display());

    shutdown_signal().await?;
    tracing::info!("shutdown requested");
    listener.abort();
    orch.shutdown().await;
    let _ = std::fs::remove_file(socket);
    println!("modeldock stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

