// src/registry/run.rs

//! The `Run` record and its status state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ModrunError, Result};
use crate::exec::EXIT_CODE_UNKNOWN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an allowed edge.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Queued)
                | (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" | "canceled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

/// One execution instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub target: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub progress: Option<u8>,
}

impl Run {
    /// A fresh `Queued` run with a random id.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target: target.into(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error: None,
            parameters: BTreeMap::new(),
            progress: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moment the run stopped being interesting for eviction purposes.
    pub fn age_reference(&self) -> DateTime<Utc> {
        if self.is_terminal() {
            self.completed_at.unwrap_or(self.created_at)
        } else {
            self.created_at
        }
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.ensure_transition(RunStatus::Running)?;
        let created = self.created_at;
        self.status = RunStatus::Running;
        self.started_at.get_or_insert_with(|| clamp_after(Utc::now(), created));
        Ok(())
    }

    /// Record the process exit: 0 completes the run, anything else fails it.
    pub fn mark_exited(&mut self, exit_code: i32) -> Result<()> {
        if self.status != RunStatus::Running {
            return Err(ModrunError::state_conflict(
                &self.id,
                format!("cannot record exit code {exit_code} for a {} run", self.status),
            ));
        }
        if exit_code == 0 {
            self.finish(RunStatus::Completed, Some(0), None)
        } else {
            self.finish(
                RunStatus::Failed,
                Some(exit_code),
                Some(format!("process exited with code {exit_code}")),
            )
        }
    }

    /// Fail the run with a message. Runs that never produced an OS exit
    /// status carry [`EXIT_CODE_UNKNOWN`].
    pub fn mark_failed(&mut self, error: impl Into<String>, exit_code: Option<i32>) -> Result<()> {
        let code = exit_code.filter(|c| *c != 0).unwrap_or(EXIT_CODE_UNKNOWN);
        self.finish(RunStatus::Failed, Some(code), Some(error.into()))
    }

    pub fn mark_cancelled(&mut self, reason: Option<String>) -> Result<()> {
        self.finish(RunStatus::Cancelled, None, reason)
    }

    pub fn set_progress(&mut self, percent: u8) -> Result<()> {
        if self.status != RunStatus::Running {
            return Err(ModrunError::state_conflict(
                &self.id,
                format!("cannot update progress of a {} run", self.status),
            ));
        }
        self.progress = Some(percent.min(100));
        Ok(())
    }

    fn finish(&mut self, status: RunStatus, exit_code: Option<i32>, error: Option<String>) -> Result<()> {
        self.ensure_transition(status)?;
        let floor = self.started_at.unwrap_or(self.created_at);
        self.status = status;
        self.exit_code = exit_code;
        if error.is_some() {
            self.error = error;
        }
        if status == RunStatus::Completed {
            self.progress = Some(100);
        }
        self.completed_at = Some(clamp_after(Utc::now(), floor));
        Ok(())
    }

    fn ensure_transition(&self, next: RunStatus) -> Result<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(ModrunError::state_conflict(
                &self.id,
                format!("illegal transition {} -> {}", self.status, next),
            ))
        }
    }

    /// Check `self` against the structural invariants of a run record.
    pub fn validate(&self) -> Result<()> {
        let has_code = self.exit_code.is_some();
        let needs_code = matches!(self.status, RunStatus::Completed | RunStatus::Failed);
        if has_code && !needs_code {
            return Err(ModrunError::state_conflict(
                &self.id,
                format!("a {} run cannot carry an exit code", self.status),
            ));
        }
        if needs_code && !has_code {
            return Err(ModrunError::state_conflict(
                &self.id,
                format!("a {} run must carry an exit code", self.status),
            ));
        }
        match (self.status, self.exit_code) {
            (RunStatus::Completed, Some(code)) if code != 0 => {
                return Err(ModrunError::state_conflict(
                    &self.id,
                    format!("completed run has non-zero exit code {code}"),
                ));
            }
            (RunStatus::Failed, Some(0)) => {
                return Err(ModrunError::state_conflict(&self.id, "failed run has exit code 0"));
            }
            _ => {}
        }
        if let Some(started) = self.started_at {
            if started < self.created_at {
                return Err(ModrunError::state_conflict(&self.id, "started before it was created"));
            }
            if self.completed_at.is_some_and(|done| done < started) {
                return Err(ModrunError::state_conflict(&self.id, "completed before it started"));
            }
        }
        if self.progress.is_some_and(|p| p > 100) {
            return Err(ModrunError::state_conflict(&self.id, "progress above 100%"));
        }
        Ok(())
    }

    /// Validate `next` as the successor of `self`.
    pub fn check_successor(&self, next: &Run) -> Result<()> {
        if next.id != self.id {
            return Err(ModrunError::state_conflict(
                &self.id,
                format!("id changed to {}", next.id),
            ));
        }
        if self.is_terminal() {
            return Err(ModrunError::state_conflict(
                &self.id,
                format!("run is already {} and cannot change", self.status),
            ));
        }
        if !self.status.can_transition_to(next.status) {
            return Err(ModrunError::state_conflict(
                &self.id,
                format!("illegal transition {} -> {}", self.status, next.status),
            ));
        }
        if next.created_at != self.created_at || next.target != self.target {
            return Err(ModrunError::state_conflict(
                &self.id,
                "target and creation time are immutable",
            ));
        }
        next.validate()
    }
}

fn clamp_after(now: DateTime<Utc>, floor: DateTime<Utc>) -> DateTime<Utc> {
    if now < floor { floor } else { now }
}
