//! Scripted deployable process for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::process::{DeployableProcess, LaunchSpec, ProcessError, TerminateMode};
use crate::types::ProcessHandle;

pub(crate) struct FakeProcess {
    pub(crate) launch_error: Mutex<Option<String>>,
    pub(crate) ready_delay: Mutex<Duration>,
    pub(crate) healthy: AtomicBool,
    pub(crate) ignore_sigterm: AtomicBool,
    pub(crate) launches: AtomicUsize,
    pub(crate) last_launch: Mutex<Option<LaunchSpec>>,
    terminations: Mutex<Vec<TerminateMode>>,
}

impl FakeProcess {
    pub(crate) fn new() -> Self {
        Self {
            launch_error: Mutex::new(None),
            ready_delay: Mutex::new(Duration::ZERO),
            healthy: AtomicBool::new(true),
            ignore_sigterm: AtomicBool::new(false),
            launches: AtomicUsize::new(0),
            last_launch: Mutex::new(None),
            terminations: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn terminations(&self) -> Vec<TerminateMode> {
        self.terminations.lock().clone()
    }
}

#[async_trait]
impl DeployableProcess for FakeProcess {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, ProcessError> {
        if let Some(e) = self.launch_error.lock().clone() {
            return Err(ProcessError::Launch(e));
        }
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        *self.last_launch.lock() = Some(spec.clone());
        Ok(ProcessHandle {
            id: format!("fake-{n}"),
            binding: spec.binding.clone(),
        })
    }

    async fn wait_ready(&self, _handle: &ProcessHandle) -> Result<(), ProcessError> {
        let delay = *self.ready_delay.lock();
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn health_probe(&self, _handle: &ProcessHandle) -> Result<(), ProcessError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProcessError::Probe("HTTP 503".to_string()))
        }
    }

    async fn terminate(&self, _handle: &ProcessHandle, mode: TerminateMode) -> Result<(), ProcessError> {
        self.terminations.lock().push(mode);
        if mode == TerminateMode::Graceful && self.ignore_sigterm.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn logs(&self, handle: &ProcessHandle, lines: usize) -> Result<Vec<String>, ProcessError> {
        Ok((0..lines).map(|i| format!("{} line {i}", handle.id)).collect())
    }
}
