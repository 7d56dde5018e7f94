//! Host CPU and memory from `/proc`.

use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::PathBuf;

use super::{HostUsage, ResourceProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Aggregate `cpu` line of `/proc/stat`. iowait counts as idle.
fn parse_cpu_line(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

/// `(total, available)` in bytes from `/proc/meminfo`.
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let kib: Option<u64> = parts.next().and_then(|v| v.parse().ok());
        match key {
            Some("MemTotal:") => total = kib,
            Some("MemAvailable:") => available = kib,
            _ => {}
        }
    }
    Some((total? * 1024, available? * 1024))
}

fn busy_percent(prev: CpuTimes, now: CpuTimes) -> f64 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let idle = now.idle.saturating_sub(prev.idle);
    (total.saturating_sub(idle) as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// CPU usage is the busy share since the previous sample, so the first
/// sample reports the average since boot.
pub struct ProcfsResources {
    root: PathBuf,
    prev: Mutex<CpuTimes>,
}

impl ProcfsResources {
    pub fn new() -> Self {
        Self::at("/proc")
    }

    /// Read from another procfs mount (or a fixture directory).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prev: Mutex::new(CpuTimes { idle: 0, total: 0 }),
        }
    }
}

impl Default for ProcfsResources {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unparseable {what}"))
}

impl ResourceProvider for ProcfsResources {
    fn sample(&self) -> io::Result<HostUsage> {
        let stat = fs::read_to_string(self.root.join("stat"))?;
        let cpu = parse_cpu_line(&stat).ok_or_else(|| invalid("/proc/stat"))?;
        let meminfo = fs::read_to_string(self.root.join("meminfo"))?;
        let (mem_total, mem_available) = parse_meminfo(&meminfo).ok_or_else(|| invalid("/proc/meminfo"))?;

        let cpu_percent = {
            let mut prev = self.prev.lock();
            let pct = busy_percent(*prev, cpu);
            *prev = cpu;
            pct
        };
        Ok(HostUsage {
            cpu_percent,
            memory_total_bytes: mem_total,
            memory_used_bytes: mem_total.saturating_sub(mem_available),
        })
    }
}
