// src/resources/probe.rs

//! Host metric sources.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Source of raw system metrics.
///
/// `None` means the host cannot report the metric.
#[async_trait]
pub trait SystemProbe: Send + Sync + fmt::Debug {
    /// CPU utilisation in percent, averaged over `window`.
    async fn cpu_percent(&self, window: Duration) -> Option<f32>;

    /// Memory available for new processes, in bytes.
    async fn available_memory_bytes(&self) -> Option<u64>;
}

/// Reads `/proc/stat` and `/proc/meminfo`. Reports nothing on hosts
/// without procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcProbe;

impl ProcProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SystemProbe for ProcProbe {
    async fn cpu_percent(&self, window: Duration) -> Option<f32> {
        let first = read_cpu_times().await?;
        tokio::time::sleep(window).await;
        let second = read_cpu_times().await?;
        cpu_percent_between(first, second)
    }

    async fn available_memory_bytes(&self) -> Option<u64> {
        let contents = match tokio::fs::read_to_string("/proc/meminfo").await {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "cannot read /proc/meminfo");
                return None;
            }
        };
        parse_mem_available(&contents)
    }
}

/// Aggregate CPU counters from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

async fn read_cpu_times() -> Option<CpuTimes> {
    match tokio::fs::read_to_string("/proc/stat").await {
        Ok(contents) => parse_cpu_times(&contents),
        Err(e) => {
            debug!(error = %e, "cannot read /proc/stat");
            None
        }
    }
}

/// Parse the `cpu ` summary line: user nice system idle iowait irq softirq steal ...
pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse().ok())
        .collect::<Option<Vec<u64>>>()?;
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    // guest time is already included in user/nice.
    let total = fields.iter().take(8).sum();
    Some(CpuTimes { idle, total })
}

pub fn cpu_percent_between(first: CpuTimes, second: CpuTimes) -> Option<f32> {
    let total = second.total.checked_sub(first.total)?;
    let idle = second.idle.checked_sub(first.idle)?;
    if total == 0 {
        return Some(0.0);
    }
    let busy = total.saturating_sub(idle);
    Some((busy as f64 / total as f64 * 100.0) as f32)
}

/// `MemAvailable:  123456 kB` → bytes.
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let mut parts = line.split_whitespace().skip(1);
    let value: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

