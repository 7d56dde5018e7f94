//! Deployment commands: `deploy`, `stop`, `restart`, `start`, `undeploy`,
//! `deployments`, `logs`, `health`.

use anyhow::Result;
use modeldock_core::control::Request;
use modeldock_core::types::{
    DeploymentId, DeploymentSnapshot, DeploymentStatus, HealthReport, ModelRef, ModelSource, Page,
    Priority, ResourceLimits,
};
use modeldock_core::DeploymentRequest;

use crate::cli::control_socket::ControlClient;

#[allow(clippy::too_many_arguments)]
pub fn deployment_request(
    model: String,
    source: ModelSource,
    name: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    gpu: Option<String>,
    cpus: Option<u32>,
    memory_mb: Option<u64>,
    priority: Priority,
) -> DeploymentRequest {
    DeploymentRequest {
        model: ModelRef::new(model, source),
        name,
        host,
        port,
        limits: ResourceLimits {
            gpu_device: gpu,
            cpu_cores: cpus,
            memory_limit_mb: memory_mb,
        },
        priority,
    }
}

fn address(d: &DeploymentSnapshot) -> String {
    d.binding
        .as_ref()
        .map(|b| b.base_url())
        .unwrap_or_else(|| "-".to_string())
}

pub async fn run_deploy(client: &mut ControlClient, request: DeploymentRequest) -> Result<()> {
    let snap: DeploymentSnapshot = client.call_as(&Request::SubmitDeployment(request)).await?;
    println!("Deployment {} ({}) is {}", snap.id, snap.name, snap.status);
    Ok(())
}

fn report(verb: &str, snap: &DeploymentSnapshot) {
    match &snap.error {
        Some(e) => println!("{verb} {}: {} ({e})", snap.id, snap.status),
        None => println!("{verb} {}: {} {}", snap.id, snap.status, address(snap)),
    }
}

pub async fn run_stop(client: &mut ControlClient, id: DeploymentId) -> Result<()> {
    let snap: DeploymentSnapshot = client.call_as(&Request::StopDeployment { id }).await?;
    report("Stopped", &snap);
    Ok(())
}

pub async fn run_restart(client: &mut ControlClient, id: DeploymentId) -> Result<()> {
    let snap: DeploymentSnapshot = client.call_as(&Request::RestartDeployment { id }).await?;
    report("Restarted", &snap);
    Ok(())
}

pub async fn run_start(client: &mut ControlClient, id: DeploymentId) -> Result<()> {
    let snap: DeploymentSnapshot = client.call_as(&Request::StartDeployment { id }).await?;
    report("Started", &snap);
    Ok(())
}

pub async fn run_undeploy(client: &mut ControlClient, id: DeploymentId) -> Result<()> {
    client.call(&Request::DeleteDeployment { id }).await?;
    println!("Removed deployment {id}");
    Ok(())
}

pub async fn run_deployments(
    client: &mut ControlClient,
    status: Option<DeploymentStatus>,
    page: usize,
    page_size: usize,
) -> Result<()> {
    let page: Page<DeploymentSnapshot> = client
        .call_as(&Request::ListDeployments {
            status,
            page: Some(page),
            page_size: Some(page_size),
        })
        .await?;
    if page.items.is_empty() {
        println!("No deployments.");
        return Ok(());
    }
    println!(
        "{:<36} {:<10} {:<9} {:<24} {}",
        "ID", "STATUS", "HEALTH", "ADDRESS", "NAME"
    );
    for d in &page.items {
        println!(
            "{:<36} {:<10} {:<9} {:<24} {}",
            d.id,
            d.status.as_str(),
            d.health.as_str(),
            address(d),
            d.name
        );
    }
    Ok(())
}

pub async fn run_logs(client: &mut ControlClient, id: DeploymentId, lines: usize) -> Result<()> {
    let logs: Vec<String> = client
        .call_as(&Request::DeploymentLogs { id, lines })
        .await?;
    for line in logs {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_health(client: &mut ControlClient, id: DeploymentId) -> Result<()> {
    let h: HealthReport = client.call_as(&Request::DeploymentHealth { id }).await?;
    let checked = h
        .last_check
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "{}: {} / {} (consecutive failures: {}, last check: {})",
        h.id, h.status, h.health, h.consecutive_failures, checked
    );
    Ok(())
}
