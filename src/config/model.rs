// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::batch::DEFAULT_MAX_CONCURRENT;
use crate::engine::orchestrator::{DEFAULT_STOP_TIMEOUT, DEFAULT_TERMINATION_TIMEOUT};
use crate::exec::SpawnRequest;
use crate::output::DEFAULT_BUFFER_CAPACITY;
use crate::resources::ResourceThresholds;
use crate::types::ExecutionMode;

pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [executor]
/// mode = "concurrent"
/// max_concurrent = 4
/// termination_timeout = "5s"
///
/// [resources]
/// max_cpu_percent = 90
/// min_available_memory_mb = 256
///
/// [output]
/// log_dir = "logs"
///
/// [history]
/// path = "runs.json"
/// retention = "24h"
///
/// [[periodic]]
/// name = "heartbeat"
/// program = "./scripts/heartbeat.sh"
/// interval = "1m"
/// ```
///
/// Every section is optional. Durations are strings and only checked by
/// validation, which turns this into [`Settings`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub executor: RawExecutorSection,

    #[serde(default)]
    pub resources: RawResourcesSection,

    #[serde(default)]
    pub output: RawOutputSection,

    #[serde(default)]
    pub history: RawHistorySection,

    #[serde(default)]
    pub pool: RawPoolSection,

    /// `[[periodic]]` module runs.
    #[serde(default)]
    pub periodic: Vec<RawPeriodicModule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawExecutorSection {
    /// Unset means auto-detect (after `MODRUN_EXECUTION_MODE`).
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub termination_timeout: Option<String>,
    #[serde(default)]
    pub stop_timeout: Option<String>,
    #[serde(default)]
    pub execution_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawResourcesSection {
    #[serde(default)]
    pub max_cpu_percent: Option<f32>,
    #[serde(default)]
    pub min_available_memory_mb: Option<u64>,
    #[serde(default)]
    pub sample_window: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawOutputSection {
    #[serde(default)]
    pub buffer_capacity: Option<usize>,
    /// Directory for per-run log files; unset keeps output in memory only.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHistorySection {
    /// History file; unset disables persistence.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub snapshot_interval: Option<String>,
    /// Terminal runs older than this are evicted. Defaults to 24h;
    /// `"never"` keeps everything.
    #[serde(default)]
    pub retention: Option<String>,
    #[serde(default)]
    pub eviction_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPoolSection {
    #[serde(default)]
    pub size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPeriodicModule {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub interval: String,
    #[serde(default)]
    pub timeout: Option<String>,
}

/// Validated configuration. Build it from a [`RawConfigFile`] with
/// `Settings::try_from`, or take the defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub executor: ExecutorSettings,
    pub resources: ResourceThresholds,
    pub output: OutputSettings,
    pub history: HistorySettings,
    pub pool: PoolSettings,
    pub periodic: Vec<PeriodicModule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub mode: Option<ExecutionMode>,
    pub max_concurrent: usize,
    pub termination_timeout: Duration,
    pub stop_timeout: Duration,
    pub execution_timeout: Option<Duration>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            mode: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            execution_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSettings {
    pub buffer_capacity: usize,
    pub log_dir: Option<PathBuf>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySettings {
    pub path: Option<PathBuf>,
    pub snapshot_interval: Duration,
    pub retention: Option<Duration>,
    pub eviction_interval: Duration,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            path: None,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            retention: Some(DEFAULT_RETENTION),
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { size: 1 }
    }
}

/// A module run on a fixed interval while `modrun serve` is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicModule {
    pub name: String,
    pub request: SpawnRequest,
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl Settings {
    /// Make relative paths relative to `base` (the config file's directory).
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        let resolve = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };
        self.output.log_dir = self.output.log_dir.map(resolve);
        self.history.path = self.history.path.map(resolve);
        for module in &mut self.periodic {
            module.request.working_dir = module.request.working_dir.take().map(resolve);
        }
        self
    }
}
