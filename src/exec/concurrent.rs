// src/exec/concurrent.rs

//! Fully asynchronous backend built on `tokio::process`.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::types::{ExecutionMode, StreamSource};

use super::backend::{
    ExecutionBackend, SpawnRequest, SpawnedProcess, check_working_dir_async, map_spawn_error,
};
#[cfg(unix)]
use super::terminate::kill_process_group;
use super::process::{
    EXIT_CODE_UNKNOWN, OutputStream, ProcessControl, ProcessHandle, ProcessTracker, exit_code_of,
    spawn_async_pump,
};

/// Default backend: processes are spawned and reaped by the Tokio reactor.
#[derive(Debug, Default)]
pub struct ConcurrentBackend {
    tracker: ProcessTracker,
}

impl ConcurrentBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_processes(&self) -> usize {
        self.tracker.live_count()
    }
}

#[async_trait]
impl ExecutionBackend for ConcurrentBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        check_working_dir_async(request).await?;

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }
        // Own group, so termination reaches the module's children too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| map_spawn_error(&request.program, e))?;

        let pid = child.id();
        let (handle, control) = ProcessHandle::new(self.tracker.next_id(), pid, &request.program);
        let program: Arc<str> = Arc::from(request.program.as_str());

        let (stdout_tx, stdout) = OutputStream::channel(StreamSource::Stdout);
        let (stderr_tx, stderr) = OutputStream::channel(StreamSource::Stderr);
        if let Some(pipe) = child.stdout.take() {
            spawn_async_pump(pipe, stdout_tx, Arc::clone(&program));
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_async_pump(pipe, stderr_tx, Arc::clone(&program));
        }

        info!(
            program = %request.program,
            pid = ?pid,
            command = %request.command_line(),
            "spawned module process"
        );

        tokio::spawn(supervise(child, control, program));
        self.tracker.track(&handle);

        Ok(SpawnedProcess {
            handle,
            stdout,
            stderr,
        })
    }

    async fn cleanup(&self) {
        let killed = self.tracker.kill_all();
        debug!(killed, "concurrent backend cleaned up");
    }
}

/// Own the child until it exits, honouring kill requests along the way.
async fn supervise(mut child: Child, mut control: ProcessControl, program: Arc<str>) {
    let status = tokio::select! {
        status = child.wait() => status,
        Some(()) = control.kill_rx.recv() => {
            debug!(program = %program, "kill requested; killing process group");
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                kill_process_group(pid);
            }
            if let Err(e) = child.start_kill() {
                warn!(program = %program, error = %e, "failed to kill child process");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            warn!(program = %program, error = %e, "failed waiting for child process");
            EXIT_CODE_UNKNOWN
        }
    };

    debug!(program = %program, exit_code = code, "module process exited");
    control.report_exit(code);
}
