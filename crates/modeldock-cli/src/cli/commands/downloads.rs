//! Download commands: `download`, `pause`, `resume`, `cancel`, `remove`, `downloads`, `show`.

use anyhow::Result;
use modeldock_core::control::Request;
use modeldock_core::types::{
    DownloadSnapshot, DownloadStatus, ModelRef, ModelSource, Page, Priority, TaskId,
};
use modeldock_core::DownloadRequest;

use super::human_bytes;
use crate::cli::control_socket::ControlClient;

pub async fn run_download(
    client: &mut ControlClient,
    model: String,
    source: ModelSource,
    priority: Priority,
    artifact: Option<String>,
) -> Result<()> {
    let mut model = ModelRef::new(model, source);
    if let Some(a) = artifact {
        model = model.with_artifact(a);
    }
    let snap: DownloadSnapshot = client
        .call_as(&Request::SubmitDownload(DownloadRequest { model, priority }))
        .await?;
    println!("Queued download {} ({}) as {}", snap.id, snap.model, snap.status);
    Ok(())
}

pub async fn run_pause(client: &mut ControlClient, id: TaskId) -> Result<()> {
    let snap: DownloadSnapshot = client.call_as(&Request::PauseDownload { id }).await?;
    println!("Paused download {id} at {}", human_bytes(snap.bytes_transferred));
    Ok(())
}

pub async fn run_resume(client: &mut ControlClient, id: TaskId) -> Result<()> {
    let snap: DownloadSnapshot = client.call_as(&Request::ResumeDownload { id }).await?;
    println!("Download {id} is {}", snap.status);
    Ok(())
}

pub async fn run_cancel(client: &mut ControlClient, id: TaskId) -> Result<()> {
    client.call(&Request::CancelDownload { id }).await?;
    println!("Cancelled download {id}");
    Ok(())
}

pub async fn run_remove(client: &mut ControlClient, id: TaskId) -> Result<()> {
    client.call(&Request::DeleteDownload { id }).await?;
    println!("Removed download {id}");
    Ok(())
}

pub async fn run_downloads(
    client: &mut ControlClient,
    status: Option<DownloadStatus>,
    page: usize,
    page_size: usize,
) -> Result<()> {
    let page: Page<DownloadSnapshot> = client
        .call_as(&Request::ListDownloads {
            status,
            page: Some(page),
            page_size: Some(page_size),
        })
        .await?;
    if page.items.is_empty() {
        println!("No downloads.");
        return Ok(());
    }
    println!(
        "{:<36} {:<11} {:>7} {:>10} {}",
        "ID", "STATUS", "DONE", "SIZE", "MODEL"
    );
    for d in &page.items {
        let size = d
            .total_bytes
            .map(human_bytes)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36} {:<11} {:>6.1}% {:>10} {}",
            d.id,
            d.status.as_str(),
            d.progress * 100.0,
            size,
            d.model
        );
    }
    if page.total_pages > 1 {
        println!("page {}/{} ({} total)", page.page, page.total_pages, page.total);
    }
    Ok(())
}

pub async fn run_show(client: &mut ControlClient, id: TaskId) -> Result<()> {
    let snap: DownloadSnapshot = client.call_as(&Request::GetDownload { id }).await?;
    println!("{}", serde_json::to_string_pretty(&snap)?);
    Ok(())
}
