// src/exec/synchronous.rs

//! Blocking backend for debugging.
//!
//! `spawn` runs the process to completion on the calling thread and returns
//! a handle that has already exited. This blocks whatever executor thread
//! calls it, which is the point: output and exit status appear in program
//! order, with no interleaving from other runs.

use std::process::{Command, Stdio};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::Result;
use crate::types::{ExecutionMode, StreamSource};

use super::backend::{
    ExecutionBackend, SpawnRequest, SpawnedProcess, check_working_dir, map_spawn_error,
};
use super::process::{OutputStream, ProcessHandle, ProcessTracker, exit_code_of};

#[derive(Debug, Default)]
pub struct SynchronousBackend {
    tracker: ProcessTracker,
}

impl SynchronousBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionBackend for SynchronousBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Synchronous
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        check_working_dir(request)?;

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        info!(
            command = %request.command_line(),
            "running module process synchronously"
        );
        let output = cmd
            .output()
            .map_err(|e| map_spawn_error(&request.program, e))?;

        let code = exit_code_of(output.status);
        debug!(program = %request.program, exit_code = code, "synchronous process finished");

        let (handle, control) = ProcessHandle::new(self.tracker.next_id(), None, &request.program);
        control.report_exit(code);

        Ok(SpawnedProcess {
            handle,
            stdout: OutputStream::from_lines(StreamSource::Stdout, split_lines(&output.stdout)),
            stderr: OutputStream::from_lines(StreamSource::Stderr, split_lines(&output.stderr)),
        })
    }

    async fn cleanup(&self) {
        // Nothing outlives a synchronous spawn.
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}
