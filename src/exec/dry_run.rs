// src/exec/dry_run.rs

//! Backend that only logs what it would have run.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::errors::Result;
use crate::types::{ExecutionMode, StreamSource};

use super::backend::{ExecutionBackend, SpawnRequest, SpawnedProcess};
use super::process::{OutputStream, ProcessHandle};

/// Every "spawn" succeeds immediately with exit code 0 and no output.
#[derive(Debug, Default)]
pub struct DryRunBackend {
    spawned: AtomicU64,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands that would have been executed.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExecutionBackend for DryRunBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::DryRun
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        let id = self.spawned.fetch_add(1, Ordering::Relaxed);
        info!(
            command = %request.command_line(),
            working_dir = ?request.working_dir,
            "dry-run: would execute module"
        );

        let (handle, control) = ProcessHandle::new(id, None, &request.program);
        control.report_exit(0);

        Ok(SpawnedProcess {
            handle,
            stdout: OutputStream::empty(StreamSource::Stdout),
            stderr: OutputStream::empty(StreamSource::Stderr),
        })
    }

    async fn cleanup(&self) {}
}
