// src/exec/terminate.rs

//! Graceful-then-forceful process termination.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::{ModrunError, Result};

use super::backend::TerminationOutcome;
use super::process::ProcessHandle;

/// Stop a process: graceful signal first, forced kill after `grace`.
///
/// Idempotent: calling it on a process that already exited (including one
/// terminated by an earlier call) returns `AlreadyExited`.
pub async fn terminate_process(
    handle: &ProcessHandle,
    grace: Duration,
) -> Result<TerminationOutcome> {
    if handle.has_exited() {
        return Ok(TerminationOutcome::AlreadyExited);
    }

    if send_graceful_stop(handle) {
        debug!(program = %handle.program(), pid = ?handle.pid(), "sent graceful stop signal");
        if timeout(grace, handle.wait()).await.is_ok() {
            info!(program = %handle.program(), pid = ?handle.pid(), "process stopped gracefully");
            return Ok(TerminationOutcome::Graceful);
        }
        warn!(
            program = %handle.program(),
            pid = ?handle.pid(),
            grace_ms = grace.as_millis() as u64,
            "process ignored graceful stop; forcing kill"
        );
    } else if handle.has_exited() {
        return Ok(TerminationOutcome::AlreadyExited);
    }

    if !handle.request_kill() && handle.has_exited() {
        return Ok(TerminationOutcome::AlreadyExited);
    }

    match timeout(grace, handle.wait()).await {
        Ok(_) => {
            info!(program = %handle.program(), pid = ?handle.pid(), "process killed");
            Ok(TerminationOutcome::Forced)
        }
        Err(_) => Err(ModrunError::Timeout {
            operation: format!("forced kill of '{}'", handle.program()),
            after: grace,
        }),
    }
}

fn send_graceful_stop(handle: &ProcessHandle) -> bool {
    #[cfg(unix)]
    {
        handle
            .pid()
            .is_some_and(|pid| signal_process_group(pid, nix::sys::signal::Signal::SIGTERM))
    }
    // No cooperative stop signal to send; go straight to the forced kill.
    #[cfg(not(unix))]
    {
        let _ = handle;
        false
    }
}

/// SIGKILL the process group led by `pid`.
///
/// Backends start every module as the leader of its own group, so this also
/// reaches whatever the module forked.
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: u32) -> bool {
    signal_process_group(pid, nix::sys::signal::Signal::SIGKILL)
}

/// Send `signal` to the group led by `pid`, falling back to the process
/// alone when it leads no group.
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let target = Pid::from_raw(raw);
    let sent = match killpg(target, signal) {
        Err(Errno::ESRCH) => kill(target, signal),
        other => other,
    };
    match sent {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid = raw, ?signal, error = %e, "failed to signal process");
            false
        }
    }
}
