// src/exec/mod.rs

//! Process execution layer.
//!
//! This module is responsible for actually launching module processes and
//! exposing their output and exit status to the orchestration engine.
//!
//! - [`backend`] defines the `ExecutionBackend` strategy trait and the
//!   `SpawnRequest` / `SpawnedProcess` types that cross it.
//! - [`process`] holds the mode-independent pieces: `ProcessHandle`,
//!   `OutputStream` and the line pumps that feed them.
//! - [`concurrent`], [`thread_backed`], [`synchronous`] and [`dry_run`] are
//!   the four backend implementations, one per `ExecutionMode`.
//! - [`mode`] probes the host once and picks (or validates) a mode.
//! - [`terminate`] implements graceful-then-forceful termination.

pub mod backend;
pub mod concurrent;
pub mod dry_run;
pub mod mode;
pub mod process;
pub mod synchronous;
pub mod terminate;
pub mod thread_backed;

pub use backend::{ExecutionBackend, SpawnRequest, SpawnedProcess, TerminationOutcome};
pub use concurrent::ConcurrentBackend;
pub use dry_run::DryRunBackend;
pub use mode::{HostCapabilities, build_backend, resolve_mode, resolve_mode_with, select_backend};
pub use process::{EXIT_CODE_UNKNOWN, OutputStream, ProcessControl, ProcessHandle, ProcessTracker};
pub use synchronous::SynchronousBackend;
pub use thread_backed::ThreadBackedBackend;
