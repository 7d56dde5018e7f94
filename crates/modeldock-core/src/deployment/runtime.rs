//! Deployable processes launched as child commands.
//!
//! The configured program is started with templated arguments, its output is
//! kept in a bounded ring buffer, and readiness/health are HTTP GETs against
//! the bound address.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use super::process::{DeployableProcess, LaunchSpec, ProcessError, TerminateMode};
use crate::config::RuntimeConfig;
use crate::types::ProcessHandle;

const READY_POLL: Duration = Duration::from_millis(500);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Last `capacity` lines of a process' stdout and stderr.
#[derive(Debug)]
struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

struct Managed {
    child: tokio::sync::Mutex<Child>,
    pid: Option<u32>,
    health_url: String,
    logs: Arc<Mutex<LogRing>>,
}

pub struct CommandRuntime {
    config: RuntimeConfig,
    processes: Mutex<HashMap<String, Arc<Managed>>>,
}

fn expand(arg: &str, spec: &LaunchSpec) -> String {
    let model_path = spec
        .model_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| spec.model.id.clone());
    arg.replace("{model_path}", &model_path)
        .replace("{model_id}", &spec.model.id)
        .replace("{host}", &spec.binding.host)
        .replace("{port}", &spec.binding.port.to_string())
}

fn collect_lines<R>(reader: R, logs: Arc<Mutex<LogRing>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.lock().push(line);
        }
    });
}

/// Blocking GET returning the response code. The body is discarded.
fn http_status(url: &str, timeout: Duration) -> Result<u32, curl::Error> {
    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.timeout(timeout)?;
    easy.connect_timeout(timeout)?;
    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| Ok(data.len()))?;
        transfer.perform()?;
    }
    easy.response_code()
}

async fn probe(url: String) -> Result<(), ProcessError> {
    let status = tokio::task::spawn_blocking(move || http_status(&url, PROBE_TIMEOUT))
        .await
        .map_err(|e| ProcessError::Probe(e.to_string()))?
        .map_err(|e| ProcessError::Probe(e.to_string()))?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(ProcessError::Probe(format!("HTTP {status}")))
    }
}

impl CommandRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn managed(&self, handle: &ProcessHandle) -> Result<Arc<Managed>, ProcessError> {
        self.processes
            .lock()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownProcess(handle.id.clone()))
    }

    fn health_url(&self, handle: &ProcessHandle) -> String {
        let path = self.config.health_path.trim_start_matches('/');
        format!("{}/{}", handle.binding.base_url(), path)
    }
}

async fn exit_status(managed: &Managed) -> Result<Option<String>, ProcessError> {
    let mut child = managed.child.lock().await;
    match child.try_wait() {
        Ok(Some(status)) => Ok(Some(status.to_string())),
        Ok(None) => Ok(None),
        Err(e) => Err(ProcessError::Exited(e.to_string())),
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child, pid: Option<u32>) -> Result<(), ProcessError> {
    let Some(pid) = pid else {
        return child
            .start_kill()
            .map_err(|e| ProcessError::Terminate(e.to_string()));
    };
    // SAFETY: kill(2) on a child we spawned and have not reaped yet.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(ProcessError::Terminate(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child, _pid: Option<u32>) -> Result<(), ProcessError> {
    child
        .start_kill()
        .map_err(|e| ProcessError::Terminate(e.to_string()))
}

#[async_trait]
impl DeployableProcess for CommandRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, ProcessError> {
        let args: Vec<String> = self.config.args.iter().map(|a| expand(a, spec)).collect();
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("MODELDOCK_DEPLOYMENT_ID", spec.deployment_id.to_string());
        if let Some(gpu) = &spec.limits.gpu_device {
            cmd.env("CUDA_VISIBLE_DEVICES", gpu);
        }
        if let Some(cores) = spec.limits.cpu_cores {
            cmd.env("OMP_NUM_THREADS", cores.to_string());
        }
        if let Some(mb) = spec.limits.memory_limit_mb {
            cmd.env("MODELDOCK_MEMORY_LIMIT_MB", mb.to_string());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::Launch(format!("{}: {}", self.config.program, e)))?;
        let pid = child.id();
        let logs = Arc::new(Mutex::new(LogRing::new(self.config.log_lines)));
        if let Some(out) = child.stdout.take() {
            collect_lines(out, logs.clone());
        }
        if let Some(err) = child.stderr.take() {
            collect_lines(err, logs.clone());
        }

        let handle = ProcessHandle {
            id: match pid {
                Some(pid) => format!("pid-{pid}"),
                None => format!("deploy-{}", spec.deployment_id),
            },
            binding: spec.binding.clone(),
        };
        tracing::info!(
            deployment_id = %spec.deployment_id,
            process = %handle.id,
            program = %self.config.program,
            args = ?args,
            "launched inference process"
        );
        let managed = Arc::new(Managed {
            child: tokio::sync::Mutex::new(child),
            pid,
            health_url: self.health_url(&handle),
            logs,
        });
        self.processes.lock().insert(handle.id.clone(), managed);
        Ok(handle)
    }

    async fn wait_ready(&self, handle: &ProcessHandle) -> Result<(), ProcessError> {
        let managed = self.managed(handle)?;
        loop {
            if let Some(status) = exit_status(&managed).await? {
                return Err(ProcessError::Exited(status));
            }
            match probe(managed.health_url.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::trace!(process = %handle.id, "not ready yet: {}", e),
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn health_probe(&self, handle: &ProcessHandle) -> Result<(), ProcessError> {
        let managed = self.managed(handle)?;
        if let Some(status) = exit_status(&managed).await? {
            return Err(ProcessError::Exited(status));
        }
        probe(managed.health_url.clone()).await
    }

    async fn terminate(&self, handle: &ProcessHandle, mode: TerminateMode) -> Result<(), ProcessError> {
        let managed = self.managed(handle)?;
        let mut child = managed.child.lock().await;
        if child
            .try_wait()
            .map_err(|e| ProcessError::Terminate(e.to_string()))?
            .is_some()
        {
            return Ok(());
        }
        match mode {
            TerminateMode::Graceful => send_sigterm(&mut child, managed.pid)?,
            TerminateMode::Forced => child
                .start_kill()
                .map_err(|e| ProcessError::Terminate(e.to_string()))?,
        }
        let status = child
            .wait()
            .await
            .map_err(|e| ProcessError::Terminate(e.to_string()))?;
        tracing::info!(process = %handle.id, ?mode, %status, "inference process exited");
        Ok(())
    }

    async fn logs(&self, handle: &ProcessHandle, lines: usize) -> Result<Vec<String>, ProcessError> {
        let managed = self.managed(handle)?;
        let tail = managed.logs.lock().tail(lines);
        Ok(tail)
    }

    async fn release(&self, handle: &ProcessHandle) {
        self.processes.lock().remove(&handle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelRef, ModelSource, NetworkBinding, ResourceLimits};
    use uuid::Uuid;

    fn spec(port: u16) -> LaunchSpec {
        LaunchSpec {
            deployment_id: Uuid::new_v4(),
            model: ModelRef::new("org/m", ModelSource::RemoteHub),
            model_path: None,
            binding: NetworkBinding {
                host: "127.0.0.1".to_string(),
                port,
            },
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn ring_keeps_the_newest_lines() {
        let mut ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.tail(10), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(ring.tail(1), vec!["line 4"]);
    }

    #[test]
    fn arguments_are_templated() {
        let mut s = spec(8123);
        assert_eq!(expand("{model_path}", &s), "org/m");
        s.model_path = Some("/models/m.gguf".into());
        assert_eq!(expand("--model={model_path}", &s), "--model=/models/m.gguf");
        assert_eq!(expand("{host}:{port}", &s), "127.0.0.1:8123");
        assert_eq!(expand("{model_id}", &s), "org/m");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_captured_and_graceful_stop_reaps_the_child() {
        let runtime = CommandRuntime::new(RuntimeConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo serving {model_id} on {port}; exec sleep 30".to_string(),
            ],
            health_path: "/health".to_string(),
            log_lines: 10,
        });
        let handle = runtime.launch(&spec(1)).await.unwrap();

        let mut lines = Vec::new();
        for _ in 0..50 {
            lines = runtime.logs(&handle, 5).await.unwrap();
            if !lines.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(lines, vec!["serving org/m on 1"]);

        runtime.terminate(&handle, TerminateMode::Graceful).await.unwrap();
        let err = runtime.health_probe(&handle).await.unwrap_err();
        assert!(matches!(err, ProcessError::Exited(_)));

        runtime.release(&handle).await;
        assert!(matches!(
            runtime.logs(&handle, 1).await,
            Err(ProcessError::UnknownProcess(_))
        ));
    }

    #[tokio::test]
    async fn missing_program_fails_to_launch() {
        let runtime = CommandRuntime::new(RuntimeConfig {
            program: "/nonexistent/modeldock-runtime".to_string(),
            ..RuntimeConfig::default()
        });
        let err = runtime.launch(&spec(1)).await.unwrap_err();
        assert!(matches!(err, ProcessError::Launch(_)));
    }
}
