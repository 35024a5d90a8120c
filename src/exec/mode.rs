// src/exec/mode.rs

//! Execution-mode selection.
//!
//! The host is probed once ([`HostCapabilities::probe`]); everything else
//! asks the probe result instead of checking platforms itself.
//!
//! Priority for determining the mode:
//! 1. `[executor].mode` from the config file (if provided)
//! 2. `MODRUN_EXECUTION_MODE` environment variable
//! 3. auto-detection from the probe

use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{info, warn};

use crate::errors::{ModrunError, Result};
use crate::types::ExecutionMode;

use super::backend::ExecutionBackend;
use super::concurrent::ConcurrentBackend;
use super::dry_run::DryRunBackend;
use super::synchronous::SynchronousBackend;
use super::thread_backed::ThreadBackedBackend;

pub const MODE_ENV_VAR: &str = "MODRUN_EXECUTION_MODE";

/// Whether this platform's Tokio build can spawn and reap child processes
/// through the reactor.
const PLATFORM_ASYNC_PROCESS: bool = cfg!(any(unix, windows));

/// What the current host/runtime can do, as far as spawning goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// A Tokio runtime is driving the current thread.
    pub runtime_available: bool,
    /// That runtime is the multi-threaded flavour.
    pub multi_thread_runtime: bool,
    /// The reactor can spawn processes on this platform.
    pub async_process_spawn: bool,
}

impl HostCapabilities {
    pub fn probe() -> Self {
        let handle = Handle::try_current().ok();
        let runtime_available = handle.is_some();
        let multi_thread_runtime = handle
            .map(|h| matches!(h.runtime_flavor(), RuntimeFlavor::MultiThread))
            .unwrap_or(false);

        Self {
            runtime_available,
            multi_thread_runtime,
            async_process_spawn: runtime_available && PLATFORM_ASYNC_PROCESS,
        }
    }

    /// The best mode this host supports.
    pub fn recommended_mode(&self) -> ExecutionMode {
        if self.async_process_spawn {
            ExecutionMode::Concurrent
        } else if self.runtime_available {
            ExecutionMode::ThreadBacked
        } else {
            ExecutionMode::Synchronous
        }
    }

    /// Verify that `mode` can work here.
    pub fn check(&self, mode: ExecutionMode) -> Result<()> {
        match mode {
            ExecutionMode::Concurrent if !self.runtime_available => Err(ModrunError::ModeMisconfigured {
                mode,
                reason: "no Tokio runtime is running on this thread".to_string(),
                remediation: "construct the backend from inside a Tokio runtime built with \
                              `enable_all()` (e.g. under `#[tokio::main]`), or set the mode to \
                              \"synchronous\""
                    .to_string(),
            }),
            ExecutionMode::Concurrent if !self.async_process_spawn => Err(ModrunError::ModeMisconfigured {
                mode,
                reason: "the async reactor cannot spawn processes on this platform".to_string(),
                remediation: "set `[executor].mode = \"thread_backed\"` (or \
                              MODRUN_EXECUTION_MODE=thread_backed) so processes are spawned \
                              on worker threads"
                    .to_string(),
            }),
            ExecutionMode::ThreadBacked if !self.runtime_available => Err(ModrunError::ModeMisconfigured {
                mode,
                reason: "thread-backed spawning needs the Tokio blocking pool, but no runtime \
                         is running on this thread"
                    .to_string(),
                remediation: "construct the backend from inside a Tokio runtime, or set the \
                              mode to \"synchronous\""
                    .to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Pure mode resolution from explicit inputs.
pub fn resolve_mode_with(
    configured: Option<ExecutionMode>,
    env_value: Option<&str>,
    caps: &HostCapabilities,
) -> Result<ExecutionMode> {
    let env_mode = env_value.and_then(|raw| match raw.parse::<ExecutionMode>() {
        Ok(mode) => Some(mode),
        Err(e) => {
            warn!(value = %raw, error = %e, "ignoring invalid {MODE_ENV_VAR}");
            None
        }
    });

    let (mode, source) = match (configured, env_mode) {
        (Some(mode), _) => (mode, "config"),
        (None, Some(mode)) => (mode, "environment"),
        (None, None) => (caps.recommended_mode(), "auto-detect"),
    };

    caps.check(mode)?;
    info!(mode = %mode, source, ?caps, "selected execution mode");
    Ok(mode)
}

/// Resolve the mode for this host, consulting the environment.
pub fn resolve_mode(configured: Option<ExecutionMode>) -> Result<ExecutionMode> {
    let env_value = std::env::var(MODE_ENV_VAR).ok();
    resolve_mode_with(configured, env_value.as_deref(), &HostCapabilities::probe())
}

/// Construct the backend implementing `mode`.
pub fn build_backend(mode: ExecutionMode) -> Arc<dyn ExecutionBackend> {
    match mode {
        ExecutionMode::Concurrent => Arc::new(ConcurrentBackend::new()),
        ExecutionMode::ThreadBacked => Arc::new(ThreadBackedBackend::new()),
        ExecutionMode::Synchronous => Arc::new(SynchronousBackend::new()),
        ExecutionMode::DryRun => Arc::new(DryRunBackend::new()),
    }
}

/// Probe, resolve and construct in one step.
pub fn select_backend(configured: Option<ExecutionMode>) -> Result<Arc<dyn ExecutionBackend>> {
    let mode = resolve_mode(configured)?;
    Ok(build_backend(mode))
}
