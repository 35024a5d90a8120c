// src/errors.rs

//! Crate-wide error type and helpers.

use std::time::Duration;

use thiserror::Error;

use crate::types::ExecutionMode;

#[derive(Error, Debug)]
pub enum ModrunError {
    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("failed to spawn '{program}': {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("execution mode '{mode}' is not available: {reason}. Remediation: {remediation}")]
    ModeMisconfigured {
        mode: ExecutionMode,
        reason: String,
        remediation: String,
    },

    #[error("insufficient resources: {metric} at {value}")]
    ResourceDenied { metric: String, value: String },

    #[error("state conflict for run {run_id}: {detail}")]
    StateConflict { run_id: String, detail: String },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("execution pool has been shut down")]
    PoolShutDown,

    #[error("batch executor is shutting down")]
    ExecutorShutDown,

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("run {0} was cancelled")]
    Cancelled(String),

    #[error("process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Payload-free classification of a [`ModrunError`].
///
/// Batch results carry this so callers can branch on the failure class
/// (e.g. retry later on `ResourceDenied`) without holding the error itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TargetNotFound,
    SpawnFailure,
    ModeMisconfigured,
    ResourceDenied,
    StateConflict,
    RunNotFound,
    PoolShutDown,
    ExecutorShutDown,
    Timeout,
    Cancelled,
    NonZeroExit,
    InvalidRequest,
    Config,
    Io,
    Panicked,
    Other,
}

impl ModrunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModrunError::TargetNotFound(_) => ErrorKind::TargetNotFound,
            ModrunError::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            ModrunError::ModeMisconfigured { .. } => ErrorKind::ModeMisconfigured,
            ModrunError::ResourceDenied { .. } => ErrorKind::ResourceDenied,
            ModrunError::StateConflict { .. } => ErrorKind::StateConflict,
            ModrunError::RunNotFound(_) => ErrorKind::RunNotFound,
            ModrunError::PoolShutDown => ErrorKind::PoolShutDown,
            ModrunError::ExecutorShutDown => ErrorKind::ExecutorShutDown,
            ModrunError::Timeout { .. } => ErrorKind::Timeout,
            ModrunError::Cancelled(_) => ErrorKind::Cancelled,
            ModrunError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            ModrunError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ModrunError::ConfigError(_) | ModrunError::TomlError(_) => ErrorKind::Config,
            ModrunError::IoError(_) | ModrunError::JsonError(_) => ErrorKind::Io,
            ModrunError::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether trying the same work again later could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ResourceDenied | ErrorKind::Timeout)
    }

    pub(crate) fn state_conflict(run_id: &str, detail: impl Into<String>) -> Self {
        ModrunError::StateConflict {
            run_id: run_id.to_string(),
            detail: detail.into(),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ModrunError>;
