// src/engine/mod.rs

//! Orchestration engine for modrun.
//!
//! This module ties together:
//! - the pattern advisor and request validation ([`pattern`])
//! - bounded batch execution with per-item isolation ([`batch`])
//! - a pool of long-lived execution backends ([`pool`])
//! - named periodic tasks ([`periodic`])
//! - the orchestrator that dispatches a module run to one of the six
//!   patterns, admitting it through the resource gate and recording it in
//!   the run registry ([`orchestrator`])
//!
//! [`assembly`] wires all of that from validated settings into an
//! [`Engine`] and owns startup/shutdown ordering.

pub mod assembly;
pub mod batch;
pub mod orchestrator;
pub mod pattern;
pub mod periodic;
pub mod pool;

pub use assembly::{Engine, EngineBuilder};
pub use batch::{BatchItemResult, BoundedBatchExecutor, WorkItem};
pub use orchestrator::{
    CapturedOutput, ExecutionOutcome, Orchestrator, OrchestratorParts, OrchestratorSettings,
    PeriodicHandle, StreamingRun,
};
pub use pattern::{ExecutionOptions, Pattern, PatternRequest, advise};
pub use periodic::{PeriodicScheduler, TaskStatistics};
pub use pool::{BackendFactory, ExecutionPool, PoolStatistics, PooledBackend};
