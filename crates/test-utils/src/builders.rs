#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use modrun::config::{PeriodicModule, Settings};
use modrun::exec::SpawnRequest;
use modrun::types::ExecutionMode;

/// Builder for `Settings` to simplify test setup.
///
/// Starts from the defaults with the resource gate disabled.
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.settings.executor.mode = Some(mode);
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.settings.executor.max_concurrent = n;
        self
    }

    pub fn termination_timeout(mut self, d: Duration) -> Self {
        self.settings.executor.termination_timeout = d;
        self
    }

    pub fn stop_timeout(mut self, d: Duration) -> Self {
        self.settings.executor.stop_timeout = d;
        self
    }

    pub fn execution_timeout(mut self, d: Duration) -> Self {
        self.settings.executor.execution_timeout = Some(d);
        self
    }

    pub fn max_cpu_percent(mut self, pct: f32) -> Self {
        self.settings.resources.max_cpu_percent = Some(pct);
        self
    }

    pub fn min_available_memory_mb(mut self, mb: u64) -> Self {
        self.settings.resources.min_available_memory_mb = Some(mb);
        self
    }

    pub fn buffer_capacity(mut self, n: usize) -> Self {
        self.settings.output.buffer_capacity = n;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.output.log_dir = Some(dir.into());
        self
    }

    pub fn history(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.history.path = Some(path.into());
        self
    }

    pub fn snapshot_interval(mut self, d: Duration) -> Self {
        self.settings.history.snapshot_interval = d;
        self
    }

    pub fn retention(mut self, d: Duration, check_every: Duration) -> Self {
        self.settings.history.retention = Some(d);
        self.settings.history.eviction_interval = check_every;
        self
    }

    /// Keep terminal runs forever.
    pub fn without_retention(mut self) -> Self {
        self.settings.history.retention = None;
        self
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.settings.pool.size = n;
        self
    }

    pub fn periodic(mut self, name: &str, request: SpawnRequest, interval: Duration) -> Self {
        self.settings.periodic.push(PeriodicModule {
            name: name.to_string(),
            request,
            interval,
            timeout: None,
        });
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `SpawnRequest`s running through `sh -c`.
pub struct SpawnRequestBuilder {
    request: SpawnRequest,
}

impl SpawnRequestBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            request: SpawnRequest::new(program),
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: &str) -> Self {
        Self {
            request: SpawnRequest::new("sh").args(["-c", script]),
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.request = self.request.arg(arg);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.request = self.request.current_dir(dir);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.request = self.request.env(key, value);
        self
    }

    pub fn build(self) -> SpawnRequest {
        self.request
    }
}
