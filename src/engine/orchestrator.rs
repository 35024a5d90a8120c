// src/engine/orchestrator.rs

//! The execution façade.
//!
//! `execute` validates the caller's options into a [`PatternRequest`] and
//! dispatches it. Every pattern bottoms out in the same run driver: create
//! the `Run`, spawn, pump output into the broadcaster, then race exit
//! against cancellation and the execution timeout. Drivers run on their own
//! Tokio tasks, so a caller that stops waiting never strands a run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ModrunError, Result};
use crate::exec::{EXIT_CODE_UNKNOWN, ExecutionBackend, OutputStream, SpawnRequest, SpawnedProcess};
use crate::output::{LogSubscription, OutputBroadcaster, parse_progress};
use crate::registry::{Run, RunRegistry, RunStatus};
use crate::resources::ResourceGate;
use crate::types::StreamSource;

use super::batch::{BatchItemResult, BoundedBatchExecutor, WorkItem};
use super::pattern::{ExecutionOptions, Pattern, PatternRequest};
use super::periodic::{PeriodicScheduler, TaskStatistics};
use super::pool::ExecutionPool;

pub const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Output of a run that was waited on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub run_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Result of [`Orchestrator::execute`], shaped by pattern.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Simple(CapturedOutput),
    Streaming(StreamingRun),
    Batch(Vec<BatchItemResult<CapturedOutput>>),
    FireAndForget { run_id: String },
    Periodic(PeriodicHandle),
    Pooled(CapturedOutput),
}

impl ExecutionOutcome {
    pub fn pattern(&self) -> Pattern {
        match self {
            ExecutionOutcome::Simple(_) => Pattern::Simple,
            ExecutionOutcome::Streaming(_) => Pattern::Streaming,
            ExecutionOutcome::Batch(_) => Pattern::BatchConcurrent,
            ExecutionOutcome::FireAndForget { .. } => Pattern::FireAndForget,
            ExecutionOutcome::Periodic(_) => Pattern::Periodic,
            ExecutionOutcome::Pooled(_) => Pattern::Pooled,
        }
    }

    /// The captured output of a Simple or Pooled execution.
    pub fn into_captured(self) -> Option<CapturedOutput> {
        match self {
            ExecutionOutcome::Simple(out) | ExecutionOutcome::Pooled(out) => Some(out),
            _ => None,
        }
    }
}

/// Timeouts the orchestrator applies when the caller gives none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub termination_timeout: Duration,
    pub stop_timeout: Duration,
    pub execution_timeout: Option<Duration>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            execution_timeout: None,
        }
    }
}

/// Everything the orchestrator dispatches to.
#[derive(Debug, Clone)]
pub struct OrchestratorParts {
    pub backend: Arc<dyn ExecutionBackend>,
    pub gate: ResourceGate,
    pub broadcaster: Arc<OutputBroadcaster>,
    pub registry: Arc<RunRegistry>,
    pub batch: Arc<BoundedBatchExecutor>,
    pub pool: Arc<ExecutionPool>,
    pub scheduler: Arc<PeriodicScheduler>,
    pub settings: OrchestratorSettings,
}

impl OrchestratorParts {
    /// In-memory components around `backend`; the pool shares it.
    pub fn with_backend(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            pool: Arc::new(ExecutionPool::shared(Arc::clone(&backend))),
            backend,
            gate: ResourceGate::disabled(),
            broadcaster: Arc::new(OutputBroadcaster::default()),
            registry: Arc::new(RunRegistry::new()),
            batch: Arc::new(BoundedBatchExecutor::default()),
            scheduler: Arc::new(PeriodicScheduler::new()),
            settings: OrchestratorSettings::default(),
        }
    }
}

#[derive(Debug)]
enum RunEnd {
    Exited(i32),
    Cancelled,
    TimedOut(Duration),
}

#[derive(Debug)]
struct Finished {
    run_id: String,
    end: RunEnd,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl Finished {
    fn into_captured(self, request: &SpawnRequest) -> Result<CapturedOutput> {
        match self.end {
            RunEnd::Exited(exit_code) => Ok(CapturedOutput {
                run_id: self.run_id,
                exit_code,
                stdout: self.stdout.join("\n"),
                stderr: self.stderr.join("\n"),
            }),
            RunEnd::Cancelled => Err(ModrunError::Cancelled(self.run_id)),
            RunEnd::TimedOut(after) => Err(ModrunError::Timeout {
                operation: format!("execution of '{}'", request.program),
                after,
            }),
        }
    }
}

fn require_success(output: CapturedOutput) -> Result<CapturedOutput> {
    if output.exit_code == 0 {
        Ok(output)
    } else {
        Err(ModrunError::NonZeroExit {
            code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

fn join_error(e: JoinError) -> ModrunError {
    ModrunError::Other(anyhow::anyhow!("run driver task failed: {e}"))
}

#[derive(Debug)]
struct Shared {
    parts: OrchestratorParts,
    active: Mutex<HashMap<String, CancellationToken>>,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            shared: Arc::new(Shared {
                parts,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_backend(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self::new(OrchestratorParts::with_backend(backend))
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.shared.parts.backend
    }

    pub fn gate(&self) -> &ResourceGate {
        &self.shared.parts.gate
    }

    pub fn broadcaster(&self) -> &Arc<OutputBroadcaster> {
        &self.shared.parts.broadcaster
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.shared.parts.registry
    }

    pub fn batch_executor(&self) -> &Arc<BoundedBatchExecutor> {
        &self.shared.parts.batch
    }

    pub fn pool(&self) -> &Arc<ExecutionPool> {
        &self.shared.parts.pool
    }

    pub fn scheduler(&self) -> &Arc<PeriodicScheduler> {
        &self.shared.parts.scheduler
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.shared.parts.settings
    }

    /// Ids of runs whose driver is still active.
    pub fn active_run_ids(&self) -> Vec<String> {
        self.shared.active.lock().keys().cloned().collect()
    }

    /// Run `target` with the pattern `options` ask for.
    pub async fn execute(&self, target: SpawnRequest, options: ExecutionOptions) -> Result<ExecutionOutcome> {
        let request = PatternRequest::from_options(&target, &options)?;
        info!(
            program = %target.program,
            pattern = %request.pattern(),
            "executing module"
        );
        let params = &options.parameters;

        match request {
            PatternRequest::Simple { timeout } => {
                let backend = Arc::clone(&self.shared.parts.backend);
                self.run_captured(backend, &target, params, Pattern::Simple, timeout)
                    .await
                    .map(ExecutionOutcome::Simple)
            }
            PatternRequest::Pooled { timeout } => {
                self.shared.parts.gate.check().await?;
                let lease = self.shared.parts.pool.acquire()?;
                let backend = Arc::clone(lease.backend());
                let output = self
                    .run_captured_admitted(backend, &target, params, Pattern::Pooled, timeout)
                    .await;
                drop(lease);
                output.map(ExecutionOutcome::Pooled)
            }
            PatternRequest::Streaming { timeout } => {
                let (run_id, token, join) = self.start_detached(&target, params, Pattern::Streaming, timeout).await?;
                Ok(ExecutionOutcome::Streaming(StreamingRun {
                    run_id,
                    program: target.program.clone(),
                    token,
                    join,
                    broadcaster: Arc::clone(&self.shared.parts.broadcaster),
                }))
            }
            PatternRequest::FireAndForget { timeout } => {
                let (run_id, _token, _join) =
                    self.start_detached(&target, params, Pattern::FireAndForget, timeout).await?;
                Ok(ExecutionOutcome::FireAndForget { run_id })
            }
            PatternRequest::BatchConcurrent {
                items,
                max_concurrent,
                timeout,
            } => self
                .run_batch(&target, params, items, max_concurrent, timeout)
                .await
                .map(ExecutionOutcome::Batch),
            PatternRequest::Periodic {
                name,
                interval,
                timeout,
            } => {
                let handle = self.register_periodic(&name, &target, interval, timeout, params)?;
                handle.enable()?;
                Ok(ExecutionOutcome::Periodic(handle))
            }
        }
    }

    /// Cancel an active run, or a run still waiting to start.
    ///
    /// Returns whether a cancellation was issued; false for runs that are
    /// already terminal or already being cancelled.
    pub fn cancel(&self, run_id: &str) -> Result<bool> {
        let token = self.shared.active.lock().get(run_id).cloned();
        if let Some(token) = token {
            if token.is_cancelled() {
                return Ok(false);
            }
            info!(run_id = %run_id, "cancelling run");
            token.cancel();
            return Ok(true);
        }

        let run = self.shared.parts.registry.get(run_id)?;
        if run.status != RunStatus::Queued {
            return Ok(false);
        }
        self.shared
            .parts
            .registry
            .modify(run_id, |r| r.mark_cancelled(Some("cancelled before start".to_string())))?;
        self.shared.parts.broadcaster.close_run(run_id);
        info!(run_id = %run_id, "cancelled queued run");
        Ok(true)
    }

    /// Register `target` as a stopped periodic task running once per
    /// `interval`. A non-zero exit, timeout or admission denial counts as an
    /// error for that tick.
    pub fn register_periodic(
        &self,
        name: &str,
        target: &SpawnRequest,
        interval: Duration,
        timeout: Option<Duration>,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<PeriodicHandle> {
        let shared = Arc::clone(&self.shared);
        let request = target.clone();
        let mut params = params.clone();
        params.insert("periodic_task".to_string(), json!(name));
        let timeout = timeout.or(self.shared.parts.settings.execution_timeout);

        self.shared.parts.scheduler.register(name, interval, move || {
            let shared = Arc::clone(&shared);
            let request = request.clone();
            let params = params.clone();
            async move {
                shared.parts.gate.check().await?;
                let backend = Arc::clone(&shared.parts.backend);
                let (run_id, token) = shared.open_run(&request, &params, Pattern::Periodic)?;
                let finished = shared
                    .spawn_driver(backend, run_id, request.clone(), token, timeout, true)
                    .await
                    .map_err(join_error)??;
                require_success(finished.into_captured(&request)?).map(|_| ())
            }
        })?;

        Ok(PeriodicHandle {
            name: name.to_string(),
            scheduler: Arc::clone(&self.shared.parts.scheduler),
        })
    }

    async fn run_captured(
        &self,
        backend: Arc<dyn ExecutionBackend>,
        target: &SpawnRequest,
        params: &BTreeMap<String, serde_json::Value>,
        pattern: Pattern,
        timeout: Option<Duration>,
    ) -> Result<CapturedOutput> {
        self.shared.parts.gate.check().await?;
        self.run_captured_admitted(backend, target, params, pattern, timeout).await
    }

    async fn run_captured_admitted(
        &self,
        backend: Arc<dyn ExecutionBackend>,
        target: &SpawnRequest,
        params: &BTreeMap<String, serde_json::Value>,
        pattern: Pattern,
        timeout: Option<Duration>,
    ) -> Result<CapturedOutput> {
        let (run_id, token) = self.shared.open_run(target, params, pattern)?;
        let timeout = timeout.or(self.shared.parts.settings.execution_timeout);
        let finished = self
            .shared
            .spawn_driver(backend, run_id, target.clone(), token, timeout, true)
            .await
            .map_err(join_error)??;
        finished.into_captured(target)
    }

    async fn start_detached(
        &self,
        target: &SpawnRequest,
        params: &BTreeMap<String, serde_json::Value>,
        pattern: Pattern,
        timeout: Option<Duration>,
    ) -> Result<(String, CancellationToken, JoinHandle<Result<Finished>>)> {
        self.shared.parts.gate.check().await?;
        let (run_id, token) = self.shared.open_run(target, params, pattern)?;
        let timeout = timeout.or(self.shared.parts.settings.execution_timeout);
        let join = self.shared.spawn_driver(
            Arc::clone(&self.shared.parts.backend),
            run_id.clone(),
            target.clone(),
            token.clone(),
            timeout,
            false,
        );
        Ok((run_id, token, join))
    }

    async fn run_batch(
        &self,
        target: &SpawnRequest,
        params: &BTreeMap<String, serde_json::Value>,
        items: Vec<WorkItem<Vec<String>>>,
        max_concurrent: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Vec<BatchItemResult<CapturedOutput>>> {
        let shared = Arc::clone(&self.shared);
        let base = target.clone();
        let params = params.clone();
        let timeout = timeout.or(self.shared.parts.settings.execution_timeout);

        let callable = move |item: WorkItem<Vec<String>>| {
            let shared = Arc::clone(&shared);
            let request = base.clone().args(item.payload);
            let mut params = params.clone();
            params.insert("batch_item".to_string(), json!(item.id));
            async move {
                shared.parts.gate.check().await?;
                let backend = Arc::clone(&shared.parts.backend);
                let (run_id, token) = shared.open_run(&request, &params, Pattern::BatchConcurrent)?;
                let finished = shared
                    .spawn_driver(backend, run_id, request.clone(), token, timeout, true)
                    .await
                    .map_err(join_error)??;
                require_success(finished.into_captured(&request)?)
            }
        };

        self.shared
            .parts
            .batch
            .run_batch(items, callable, max_concurrent)
            .await
    }
}

impl Shared {
    /// Record a new `Queued` run and make it cancellable.
    fn open_run(
        &self,
        request: &SpawnRequest,
        params: &BTreeMap<String, serde_json::Value>,
        pattern: Pattern,
    ) -> Result<(String, CancellationToken)> {
        let mut run = Run::new(request.target_id());
        run.parameters = params.clone();
        run.parameters.insert("args".to_string(), json!(request.args));
        run.parameters.insert("pattern".to_string(), json!(pattern.as_str()));
        let run_id = run.id.clone();

        self.parts.registry.create(run)?;
        let token = CancellationToken::new();
        self.active.lock().insert(run_id.clone(), token.clone());
        Ok((run_id, token))
    }

    fn spawn_driver(
        self: &Arc<Self>,
        backend: Arc<dyn ExecutionBackend>,
        run_id: String,
        request: SpawnRequest,
        token: CancellationToken,
        timeout: Option<Duration>,
        capture: bool,
    ) -> JoinHandle<Result<Finished>> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = shared
                .drive(backend.as_ref(), &run_id, &request, &token, timeout, capture)
                .await;
            shared.active.lock().remove(&run_id);
            shared.parts.broadcaster.close_run(&run_id);
            result
        })
    }

    async fn drive(
        self: &Arc<Self>,
        backend: &dyn ExecutionBackend,
        run_id: &str,
        request: &SpawnRequest,
        token: &CancellationToken,
        timeout: Option<Duration>,
        capture: bool,
    ) -> Result<Finished> {
        let registry = &self.parts.registry;
        let grace = self.parts.settings.termination_timeout;

        if token.is_cancelled() {
            self.record(run_id, |r| r.mark_cancelled(Some("cancelled before start".to_string())));
            return Ok(Finished::empty(run_id, RunEnd::Cancelled));
        }

        let SpawnedProcess { handle, stdout, stderr } = match backend.spawn(request).await {
            Ok(spawned) => spawned,
            Err(e) => {
                let message = e.to_string();
                warn!(run_id = %run_id, program = %request.program, error = %e, "spawn failed");
                self.parts
                    .broadcaster
                    .append_line(run_id, format!("[ERROR] {message}"), StreamSource::Stderr);
                self.record(run_id, |r| r.mark_failed(message.clone(), None));
                return Err(e);
            }
        };

        if let Err(e) = registry.modify(run_id, |r| r.mark_running()) {
            // Only a cancel can move a queued run out from under us.
            debug!(run_id = %run_id, error = %e, "run left Queued before it started");
            if let Err(e) = backend.terminate(&handle, grace).await {
                warn!(run_id = %run_id, error = %e, "failed to stop process of a cancelled run");
            }
            return Ok(Finished::empty(run_id, RunEnd::Cancelled));
        }
        info!(
            run_id = %run_id,
            program = %request.program,
            pid = ?handle.pid(),
            "run started"
        );

        let stdout_pump = tokio::spawn(pump(Arc::clone(self), run_id.to_string(), stdout, capture));
        let stderr_pump = tokio::spawn(pump(Arc::clone(self), run_id.to_string(), stderr, capture));

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let end = tokio::select! {
            code = backend.wait(&handle) => match code {
                Ok(code) => RunEnd::Exited(code),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "failed waiting for process");
                    RunEnd::Exited(EXIT_CODE_UNKNOWN)
                }
            },
            _ = token.cancelled() => RunEnd::Cancelled,
            _ = deadline => RunEnd::TimedOut(timeout.unwrap_or_default()),
        };

        // Cancelled and timed-out runs are final as soon as the process is
        // gone; their output tail is drained afterwards.
        if !matches!(end, RunEnd::Exited(_)) {
            match backend.terminate(&handle, grace).await {
                Ok(outcome) => debug!(run_id = %run_id, ?outcome, "process terminated"),
                Err(e) => warn!(run_id = %run_id, error = %e, "failed to terminate process"),
            }
            self.record_end(run_id, &end);
            self.parts.broadcaster.close_run(run_id);
        }

        let drain_deadline = Instant::now() + grace;
        let (stdout, stderr) = tokio::join!(
            join_pump(stdout_pump, drain_deadline, run_id),
            join_pump(stderr_pump, drain_deadline, run_id),
        );

        if matches!(end, RunEnd::Exited(_)) {
            self.record_end(run_id, &end);
        }

        Ok(Finished {
            run_id: run_id.to_string(),
            end,
            stdout,
            stderr,
        })
    }

    fn record_end(&self, run_id: &str, end: &RunEnd) {
        match end {
            RunEnd::Exited(code) => {
                let code = *code;
                self.record(run_id, |r| r.mark_exited(code));
                info!(run_id = %run_id, exit_code = code, "run finished");
            }
            RunEnd::Cancelled => {
                self.record(run_id, |r| r.mark_cancelled(Some("cancelled by request".to_string())));
                info!(run_id = %run_id, "run cancelled");
            }
            RunEnd::TimedOut(after) => {
                let message = format!("execution timed out after {after:?}");
                self.record(run_id, |r| r.mark_failed(message.clone(), None));
                warn!(run_id = %run_id, timeout_ms = after.as_millis() as u64, "run timed out");
            }
        }
    }

    /// Apply a terminal transition, logging instead of failing if the run
    /// already reached a terminal state.
    fn record<F>(&self, run_id: &str, f: F)
    where
        F: FnOnce(&mut Run) -> Result<()>,
    {
        if let Err(e) = self.parts.registry.modify(run_id, f) {
            warn!(run_id = %run_id, error = %e, "could not record run transition");
        }
    }
}

impl Finished {
    fn empty(run_id: &str, end: RunEnd) -> Self {
        Self {
            run_id: run_id.to_string(),
            end,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

async fn pump(shared: Arc<Shared>, run_id: String, mut stream: OutputStream, capture: bool) -> Vec<String> {
    let source = stream.source();
    let mut captured = Vec::new();
    while let Some(line) = stream.next_line().await {
        if let Some(percent) = parse_progress(&line) {
            if let Err(e) = shared.parts.registry.modify(&run_id, |r| r.set_progress(percent)) {
                debug!(run_id = %run_id, error = %e, "ignoring progress marker");
            }
        }
        if capture {
            captured.push(line.clone());
        }
        shared.parts.broadcaster.append_line(&run_id, line, source);
    }
    captured
}

/// Collect a pump's lines, giving up at `deadline` (shared by both pumps).
async fn join_pump(mut pump: JoinHandle<Vec<String>>, deadline: Instant, run_id: &str) -> Vec<String> {
    match tokio::time::timeout_at(deadline, &mut pump).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => {
            warn!(run_id = %run_id, error = %e, "output pump failed");
            Vec::new()
        }
        Err(_) => {
            warn!(run_id = %run_id, "output still open after process exit; detaching");
            pump.abort();
            Vec::new()
        }
    }
}

/// A long-running execution whose output flows through the broadcaster.
#[derive(Debug)]
pub struct StreamingRun {
    run_id: String,
    program: String,
    token: CancellationToken,
    join: JoinHandle<Result<Finished>>,
    broadcaster: Arc<OutputBroadcaster>,
}

impl StreamingRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Everything printed so far, then live lines until the run ends.
    pub fn subscribe(&self) -> LogSubscription {
        self.broadcaster.subscribe_with_replay(&self.run_id)
    }

    /// Request graceful-then-forceful termination.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the process and return its exit code.
    pub async fn wait(self) -> Result<i32> {
        let finished = self.join.await.map_err(join_error)??;
        match finished.end {
            RunEnd::Exited(code) => Ok(code),
            RunEnd::Cancelled => Err(ModrunError::Cancelled(self.run_id)),
            RunEnd::TimedOut(after) => Err(ModrunError::Timeout {
                operation: format!("execution of '{}'", self.program),
                after,
            }),
        }
    }
}

/// Control over a registered periodic execution.
#[derive(Debug, Clone)]
pub struct PeriodicHandle {
    name: String,
    scheduler: Arc<PeriodicScheduler>,
}

impl PeriodicHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enable(&self) -> Result<()> {
        self.scheduler.start(&self.name)
    }

    /// Stop the loop; true when it stopped within `timeout`.
    pub async fn disable(&self, timeout: Duration) -> bool {
        self.scheduler.stop(&self.name, timeout).await
    }

    pub fn statistics(&self) -> Option<TaskStatistics> {
        self.scheduler.statistics(&self.name)
    }
}
