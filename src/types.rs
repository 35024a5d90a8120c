use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How an execution backend launches processes.
///
/// - `Concurrent`: fully asynchronous spawn through the Tokio reactor.
/// - `ThreadBacked`: blocking `std::process` calls moved onto the runtime's
///   blocking-thread pool, for hosts where async spawning is unavailable.
/// - `Synchronous`: blocking spawn on the calling thread (debugging only).
/// - `DryRun`: log the command line and pretend it exited with 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Concurrent,
    ThreadBacked,
    Synchronous,
    DryRun,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Concurrent => "concurrent",
            ExecutionMode::ThreadBacked => "thread_backed",
            ExecutionMode::Synchronous => "synchronous",
            ExecutionMode::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "concurrent" | "async" => Ok(ExecutionMode::Concurrent),
            "thread_backed" | "threaded" => Ok(ExecutionMode::ThreadBacked),
            "synchronous" | "sync" => Ok(ExecutionMode::Synchronous),
            "dry_run" | "dryrun" => Ok(ExecutionMode::DryRun),
            other => Err(format!(
                "invalid execution mode: {other} (expected \"concurrent\", \"thread_backed\", \"synchronous\" or \"dry_run\")"
            )),
        }
    }
}

/// Which pipe a captured output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSource::Stdout => f.write_str("stdout"),
            StreamSource::Stderr => f.write_str("stderr"),
        }
    }
}

/// Best-effort severity parsed from textual markers in module output.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}
