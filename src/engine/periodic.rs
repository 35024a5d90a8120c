// src/engine/periodic.rs

//! Named callables on fixed intervals.
//!
//! Each started task owns one Tokio task looping: run the callable, record
//! the outcome, wait for the next tick or the stop signal. Errors and panics
//! are counted and logged; they never end the loop.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ModrunError, Result};

use super::batch::panic_message;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type TaskCallable = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatistics {
    pub run_count: u64,
    pub error_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub is_running: bool,
}

#[derive(Debug, Default)]
struct RunTally {
    run_count: u64,
    error_count: u64,
    last_run: Option<DateTime<Utc>>,
}

// Counts live under one lock so readers never see them disagree.
#[derive(Debug, Default)]
struct TaskCounters {
    tally: Mutex<RunTally>,
    is_running: AtomicBool,
}

impl TaskCounters {
    fn record(&self, started: DateTime<Utc>, failed: bool) {
        let mut tally = self.tally.lock();
        tally.run_count += 1;
        if failed {
            tally.error_count += 1;
        }
        tally.last_run = Some(started);
    }

    fn snapshot(&self) -> TaskStatistics {
        let tally = self.tally.lock();
        TaskStatistics {
            run_count: tally.run_count,
            error_count: tally.error_count,
            last_run: tally.last_run,
            is_running: self.is_running.load(Ordering::SeqCst),
        }
    }
}

struct ActiveLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct TaskEntry {
    interval: Duration,
    callable: TaskCallable,
    counters: Arc<TaskCounters>,
    active: Option<ActiveLoop>,
}

#[derive(Default)]
pub struct PeriodicScheduler {
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl fmt::Debug for PeriodicScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicScheduler")
            .field("tasks", &self.task_names())
            .finish()
    }
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stopped task. Names are unique and the interval must be non-zero.
    pub fn register<F, Fut>(&self, name: impl Into<String>, every: Duration, callable: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if every.is_zero() {
            return Err(ModrunError::InvalidRequest(format!(
                "periodic task '{name}' needs a non-zero interval"
            )));
        }

        let callable: TaskCallable = Arc::new(move || Box::pin(callable()) as TaskFuture);
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&name) {
            return Err(ModrunError::InvalidRequest(format!(
                "periodic task '{name}' is already registered"
            )));
        }
        debug!(task = %name, interval_ms = every.as_millis() as u64, "registered periodic task");
        tasks.insert(
            name,
            TaskEntry {
                interval: every,
                callable,
                counters: Arc::new(TaskCounters::default()),
                active: None,
            },
        );
        Ok(())
    }

    /// Start the task's loop; the first run happens immediately. Starting a
    /// running task does nothing.
    pub fn start(&self, name: &str) -> Result<()> {
        let mut tasks = self.tasks.lock();
        let entry = tasks
            .get_mut(name)
            .ok_or_else(|| ModrunError::InvalidRequest(format!("unknown periodic task '{name}'")))?;

        if entry.active.as_ref().is_some_and(|a| !a.handle.is_finished()) {
            return Ok(());
        }

        let token = CancellationToken::new();
        entry.counters.is_running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(task_loop(
            name.to_string(),
            entry.interval,
            Arc::clone(&entry.callable),
            Arc::clone(&entry.counters),
            token.clone(),
        ));
        entry.active = Some(ActiveLoop { token, handle });
        info!(task = %name, interval_ms = entry.interval.as_millis() as u64, "periodic task started");
        Ok(())
    }

    /// Start every stopped task; returns how many were started.
    pub fn start_all(&self) -> usize {
        let stopped: Vec<String> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, e)| e.active.as_ref().is_none_or(|a| a.handle.is_finished()))
            .map(|(name, _)| name.clone())
            .collect();

        stopped
            .iter()
            .filter(|name| self.start(name).is_ok())
            .count()
    }

    /// Signal the loop to stop and wait up to `timeout` for it.
    ///
    /// Returns true if the loop ended on its own (or was not running),
    /// false if it had to be aborted or the task is unknown.
    pub async fn stop(&self, name: &str, timeout: Duration) -> bool {
        let (active, counters) = {
            let mut tasks = self.tasks.lock();
            let Some(entry) = tasks.get_mut(name) else {
                warn!(task = %name, "stop requested for unknown periodic task");
                return false;
            };
            (entry.active.take(), Arc::clone(&entry.counters))
        };
        let Some(ActiveLoop { token, mut handle }) = active else {
            return true;
        };

        token.cancel();
        let graceful = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(task = %name, timeout_ms = timeout.as_millis() as u64, "periodic task did not stop in time; aborting");
                handle.abort();
                false
            }
        };
        counters.is_running.store(false, Ordering::SeqCst);
        info!(task = %name, graceful, "periodic task stopped");
        graceful
    }

    /// Stop every task concurrently. True if all stopped gracefully.
    pub async fn stop_all(&self, timeout: Duration) -> bool {
        let names = self.task_names();
        let outcomes = join_all(names.iter().map(|name| self.stop(name, timeout))).await;
        outcomes.into_iter().all(|graceful| graceful)
    }

    /// Stop (if needed) and forget a task.
    pub async fn unregister(&self, name: &str, timeout: Duration) -> bool {
        if !self.is_registered(name) {
            return false;
        }
        self.stop(name, timeout).await;
        self.tasks.lock().remove(name).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks.lock().contains_key(name)
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn statistics(&self, name: &str) -> Option<TaskStatistics> {
        self.tasks.lock().get(name).map(|e| e.counters.snapshot())
    }

    pub fn all_statistics(&self) -> BTreeMap<String, TaskStatistics> {
        self.tasks
            .lock()
            .iter()
            .map(|(name, e)| (name.clone(), e.counters.snapshot()))
            .collect()
    }
}

async fn task_loop(
    name: String,
    every: Duration,
    callable: TaskCallable,
    counters: Arc<TaskCounters>,
    token: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Utc::now();
        let outcome = AssertUnwindSafe(async { callable().await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                counters.record(started, false);
                debug!(task = %name, "periodic task run succeeded");
            }
            Ok(Err(e)) => {
                counters.record(started, true);
                warn!(task = %name, error = %e, "periodic task run failed");
            }
            Err(panic) => {
                counters.record(started, true);
                error!(task = %name, panic = %panic_message(panic.as_ref()), "periodic task panicked");
            }
        }
    }

    counters.is_running.store(false, Ordering::SeqCst);
    debug!(task = %name, "periodic task loop exited");
}
