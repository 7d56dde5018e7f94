//! `modeldock queue` and `modeldock storage`.

use anyhow::Result;
use modeldock_core::control::{QueueReport, Request};
use modeldock_core::scheduler::QueueStatus;
use modeldock_core::storage::StorageUsage;

use super::human_bytes;
use crate::cli::control_socket::ControlClient;

fn print_pool(q: &QueueStatus) {
    println!(
        "{:<11} active {}/{}  queued {}/{}",
        q.pool.to_string(), q.active_count, q.limit, q.depth, q.capacity
    );
    for (i, t) in q.queued.iter().enumerate() {
        println!("  {:>3}. {} ({}, since {})", i + 1, t.id, t.priority.as_str(), t.enqueued_at.to_rfc3339());
    }
}

pub async fn run_queue(client: &mut ControlClient) -> Result<()> {
    let report: QueueReport = client.call_as(&Request::QueueStatus).await?;
    print_pool(&report.download);
    print_pool(&report.deployment);
    Ok(())
}

pub async fn run_storage(client: &mut ControlClient) -> Result<()> {
    let u: StorageUsage = client.call_as(&Request::StorageUsage).await?;
    println!(
        "total {}  used {}  free {}  reserved {}",
        human_bytes(u.total),
        human_bytes(u.used),
        human_bytes(u.free),
        human_bytes(u.reserved)
    );
    Ok(())
}
