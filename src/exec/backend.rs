// src/exec/backend.rs

//! Pluggable execution backend abstraction.
//!
//! The orchestrator talks to an `ExecutionBackend` instead of spawning
//! processes itself. Each `ExecutionMode` has one implementation, chosen once
//! at startup by [`super::mode::select_backend`]; tests can provide their own
//! implementation that never touches the OS.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{ModrunError, Result};
use crate::types::ExecutionMode;

use super::process::{OutputStream, ProcessHandle};
use super::terminate::terminate_process;

/// Everything needed to launch one module process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Identifier recorded on runs created for this request.
    pub fn target_id(&self) -> &str {
        &self.program
    }

    /// Human-readable command line, used for logging and dry runs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push_str(&format!("{arg:?}"));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// A freshly spawned process together with its output streams.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

/// How a [`ExecutionBackend::terminate`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Nothing to do: the process had already exited.
    AlreadyExited,
    /// The process exited after the graceful stop signal.
    Graceful,
    /// The process had to be killed.
    Forced,
}

/// Strategy trait abstracting how module processes are launched.
///
/// Implementations must be safe to share between many concurrent callers;
/// the execution pool hands one backend to everyone.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + fmt::Debug {
    /// The mode this backend implements.
    fn mode(&self) -> ExecutionMode;

    /// Launch a process.
    ///
    /// Errors distinguish a missing executable (`TargetNotFound`) from an OS
    /// refusal (`SpawnFailure`) and an unusable mode (`ModeMisconfigured`).
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess>;

    /// Wait for the process to exit and return its exit code.
    async fn wait(&self, handle: &ProcessHandle) -> Result<i32> {
        Ok(handle.wait().await)
    }

    /// Graceful stop, escalating to a forced kill after `timeout`.
    async fn terminate(
        &self,
        handle: &ProcessHandle,
        timeout: Duration,
    ) -> Result<TerminationOutcome> {
        terminate_process(handle, timeout).await
    }

    /// Kill anything this backend spawned that is still alive.
    async fn cleanup(&self);
}

/// Translate an OS spawn error into the crate taxonomy.
pub(crate) fn map_spawn_error(program: &str, err: io::Error) -> ModrunError {
    match err.kind() {
        io::ErrorKind::NotFound => ModrunError::TargetNotFound(program.to_string()),
        _ => ModrunError::SpawnFailure {
            program: program.to_string(),
            source: err,
        },
    }
}

/// The OS reports a missing working directory as `NotFound`, which would be
/// indistinguishable from a missing executable, so check it up front.
pub(crate) fn check_working_dir(request: &SpawnRequest) -> Result<()> {
    match request.working_dir.as_deref() {
        Some(dir) if !dir.is_dir() => Err(missing_dir_error(&request.program, dir)),
        _ => Ok(()),
    }
}

/// Async flavour of [`check_working_dir`] for use on runtime threads.
pub(crate) async fn check_working_dir_async(request: &SpawnRequest) -> Result<()> {
    let Some(dir) = request.working_dir.as_deref() else {
        return Ok(());
    };
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(missing_dir_error(&request.program, dir)),
    }
}

fn missing_dir_error(program: &str, dir: &Path) -> ModrunError {
    ModrunError::SpawnFailure {
        program: program.to_string(),
        source: io::Error::new(
            io::ErrorKind::NotFound,
            format!("working directory {} does not exist", dir.display()),
        ),
    }
}
