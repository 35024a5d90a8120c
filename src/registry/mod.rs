// src/registry/mod.rs

//! Authoritative store of every run.
//!
//! All mutation goes through `create`, `update` or `modify`, which validate
//! the status transition under the store lock. Terminal runs never change.

pub mod history;
pub mod run;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{ModrunError, Result};

pub use run::{Run, RunStatus};

/// Error recorded on runs that a previous process left unfinished.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Filter for [`RunRegistry::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunQuery {
    pub target: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl RunQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn matches(&self, run: &Run) -> bool {
        self.target.as_deref().is_none_or(|t| run.target == t)
            && self.status.is_none_or(|s| run.status == s)
    }
}

#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, Run>>,
    dirty: AtomicBool,
    history_path: Option<PathBuf>,
}

impl RunRegistry {
    /// In-memory registry without a history file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry that snapshots to `path`.
    pub fn with_history(path: impl Into<PathBuf>) -> Self {
        Self {
            history_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Restore the registry from `path` (missing file → empty registry).
    ///
    /// Runs a previous process left `Queued` or `Running` are failed with
    /// [`INTERRUPTED_BY_RESTART`].
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let read_path = path.clone();
        let doc = tokio::task::spawn_blocking(move || history::read_history(&read_path))
            .await
            .map_err(|e| ModrunError::Other(anyhow::anyhow!("history load task failed: {e}")))??;

        let registry = Self::with_history(&path);
        let Some(doc) = doc else {
            debug!(path = %path.display(), "no run history yet");
            return Ok(registry);
        };

        let mut reconciled = 0usize;
        {
            let mut runs = registry.runs.lock();
            for mut run in doc.runs {
                if !run.is_terminal() {
                    if let Err(e) = run.mark_failed(INTERRUPTED_BY_RESTART, None) {
                        warn!(run_id = %run.id, error = %e, "cannot reconcile interrupted run; skipping");
                        continue;
                    }
                    reconciled += 1;
                }
                runs.insert(run.id.clone(), run);
            }
            info!(
                path = %path.display(),
                runs = runs.len(),
                reconciled,
                "loaded run history"
            );
        }
        if reconciled > 0 {
            registry.mark_dirty();
        }
        Ok(registry)
    }

    pub fn history_path(&self) -> Option<&Path> {
        self.history_path.as_deref()
    }

    /// Insert a new run. Duplicate ids are a `StateConflict`.
    pub fn create(&self, run: Run) -> Result<()> {
        run.validate()?;
        let mut runs = self.runs.lock();
        if runs.contains_key(&run.id) {
            return Err(ModrunError::state_conflict(&run.id, "a run with this id already exists"));
        }
        debug!(run_id = %run.id, target = %run.target, status = %run.status, "run created");
        runs.insert(run.id.clone(), run);
        drop(runs);
        self.mark_dirty();
        Ok(())
    }

    /// Replace a stored run with its successor.
    pub fn update(&self, run: Run) -> Result<()> {
        let mut runs = self.runs.lock();
        let current = runs
            .get(&run.id)
            .ok_or_else(|| ModrunError::RunNotFound(run.id.clone()))?;
        current.check_successor(&run)?;
        debug!(run_id = %run.id, from = %current.status, to = %run.status, "run updated");
        runs.insert(run.id.clone(), run);
        drop(runs);
        self.mark_dirty();
        Ok(())
    }

    /// Atomic read-modify-write. `f` works on a copy; the copy is stored
    /// only if `f` succeeds and the result is a valid successor.
    pub fn modify<F, R>(&self, run_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Run) -> Result<R>,
    {
        let mut runs = self.runs.lock();
        let current = runs
            .get(run_id)
            .ok_or_else(|| ModrunError::RunNotFound(run_id.to_string()))?;
        let mut next = current.clone();
        let out = f(&mut next)?;
        current.check_successor(&next)?;
        runs.insert(run_id.to_string(), next);
        drop(runs);
        self.mark_dirty();
        Ok(out)
    }

    pub fn get(&self, run_id: &str) -> Result<Run> {
        self.runs
            .lock()
            .get(run_id)
            .cloned()
            .ok_or_else(|| ModrunError::RunNotFound(run_id.to_string()))
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.lock().contains_key(run_id)
    }

    /// Matching runs, newest first (ties broken by id).
    pub fn list(&self, query: &RunQuery) -> Vec<Run> {
        let mut selected: Vec<Run> = self
            .runs
            .lock()
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let page = selected.into_iter().skip(query.offset);
        match query.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop runs older than `max_age`. Age counts from completion for
    /// terminal runs and from creation otherwise.
    pub fn evict_older_than(&self, max_age: Duration, only_terminal: bool) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|_, run| {
            if only_terminal && !run.is_terminal() {
                return true;
            }
            now.signed_duration_since(run.age_reference()) <= max_age
        });
        let evicted = before - runs.len();
        drop(runs);

        if evicted > 0 {
            info!(evicted, "evicted old runs");
            self.mark_dirty();
        }
        evicted
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Persist the registry if anything changed since the last snapshot.
    ///
    /// Returns whether a file was written. Serialization and file I/O run on
    /// the blocking pool.
    pub async fn snapshot(&self) -> Result<bool> {
        let Some(path) = self.history_path.clone() else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let runs: Vec<Run> = self.runs.lock().values().cloned().collect();
        let result = tokio::task::spawn_blocking(move || history::write_snapshot(&path, runs))
            .await
            .map_err(|e| ModrunError::Other(anyhow::anyhow!("history snapshot task failed: {e}")))
            .and_then(|r| r);

        if let Err(e) = &result {
            warn!(error = %e, "run history snapshot failed; will retry");
            self.mark_dirty();
        }
        result.map(|()| true)
    }
}
