// src/exec/thread_backed.rs

//! Backend for hosts where the reactor cannot spawn processes.
//!
//! Each process is spawned and supervised with the blocking `std::process`
//! API on Tokio's bounded blocking-thread pool, so the caller's event loop is
//! never blocked. Each live process holds three pool threads: one supervisor
//! and one reader per output pipe. The pool's `max_blocking_threads` caps the
//! total; work beyond it queues until a process exits.

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::{ModrunError, Result};
use crate::types::{ExecutionMode, StreamSource};

use super::backend::{
    ExecutionBackend, SpawnRequest, SpawnedProcess, check_working_dir, map_spawn_error,
};
#[cfg(unix)]
use super::terminate::kill_process_group;
use super::process::{
    EXIT_CODE_UNKNOWN, OutputStream, ProcessControl, ProcessHandle, ProcessTracker, exit_code_of,
    spawn_blocking_pump,
};

/// How often a supervising worker checks for exit and kill requests.
const SUPERVISE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
pub struct ThreadBackedBackend {
    tracker: ProcessTracker,
}

impl ThreadBackedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_processes(&self) -> usize {
        self.tracker.live_count()
    }
}

#[async_trait]
impl ExecutionBackend for ThreadBackedBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::ThreadBacked
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        let request = request.clone();
        let id = self.tracker.next_id();
        let (stdout_tx, stdout) = OutputStream::channel(StreamSource::Stdout);
        let (stderr_tx, stderr) = OutputStream::channel(StreamSource::Stderr);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<ProcessHandle>>();
        let runtime = tokio::runtime::Handle::current();

        tokio::task::spawn_blocking(move || {
            let (child, handle, control) = match start_child(&runtime, &request, id, stdout_tx, stderr_tx) {
                Ok(started) => started,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let program: Arc<str> = Arc::from(request.program.as_str());
            if ready_tx.send(Ok(handle)).is_err() {
                debug!(program = %program, "spawn caller went away; supervising anyway");
            }
            supervise_blocking(child, control, program);
        });

        let handle = ready_rx.await.map_err(|_| {
            ModrunError::Other(anyhow::anyhow!(
                "thread-backed spawn worker exited before reporting"
            ))
        })??;

        self.tracker.track(&handle);
        Ok(SpawnedProcess {
            handle,
            stdout,
            stderr,
        })
    }

    async fn cleanup(&self) {
        let killed = self.tracker.kill_all();
        debug!(killed, "thread-backed backend cleaned up");
    }
}

fn start_child(
    runtime: &tokio::runtime::Handle,
    request: &SpawnRequest,
    id: u64,
    stdout_tx: mpsc::UnboundedSender<String>,
    stderr_tx: mpsc::UnboundedSender<String>,
) -> Result<(Child, ProcessHandle, ProcessControl)> {
    check_working_dir(request)?;

    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &request.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| map_spawn_error(&request.program, e))?;

    let program: Arc<str> = Arc::from(request.program.as_str());
    if let Some(pipe) = child.stdout.take() {
        spawn_blocking_pump(runtime, pipe, stdout_tx, Arc::clone(&program));
    }
    if let Some(pipe) = child.stderr.take() {
        spawn_blocking_pump(runtime, pipe, stderr_tx, Arc::clone(&program));
    }

    let pid = child.id();
    info!(
        program = %request.program,
        pid,
        command = %request.command_line(),
        "spawned module process on worker thread"
    );

    let (handle, control) = ProcessHandle::new(id, Some(pid), &request.program);
    Ok((child, handle, control))
}

fn supervise_blocking(mut child: Child, mut control: ProcessControl, program: Arc<str>) {
    let code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break exit_code_of(status),
            Ok(None) => {
                if control.kill_rx.try_recv().is_ok() {
                    debug!(program = %program, "kill requested; killing process group");
                    #[cfg(unix)]
                    kill_process_group(child.id());
                    if let Err(e) = child.kill() {
                        warn!(program = %program, error = %e, "failed to kill child process");
                    }
                }
                std::thread::sleep(SUPERVISE_POLL);
            }
            Err(e) => {
                warn!(program = %program, error = %e, "failed waiting for child process");
                break EXIT_CODE_UNKNOWN;
            }
        }
    };

    debug!(program = %program, exit_code = code, "module process exited");
    control.report_exit(code);
}
