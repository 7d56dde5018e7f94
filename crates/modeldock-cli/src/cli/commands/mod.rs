//! CLI command handlers, grouped by what they act on.

mod checksum;
mod deployments;
mod downloads;
mod generate;
mod queue;
mod serve;
mod watch;

pub use checksum::run_checksum;
pub use deployments::{
    deployment_request, run_deploy, run_deployments, run_health, run_logs, run_restart, run_start,
    run_stop, run_undeploy,
};
pub use downloads::{
    run_cancel, run_download, run_downloads, run_pause, run_remove, run_resume, run_show,
};
pub use generate::{run_completions, run_man};
pub use queue::{run_queue, run_storage};
pub use serve::run_serve;
pub use watch::run_watch;

/// Human-readable byte count.
pub(crate) fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
