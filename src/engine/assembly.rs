// src/engine/assembly.rs

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::errors::Result;
use crate::exec::{ExecutionBackend, build_backend, select_backend};
use crate::output::OutputBroadcaster;
use crate::registry::RunRegistry;
use crate::resources::ResourceGate;
use crate::resources::probe::SystemProbe;

use super::batch::BoundedBatchExecutor;
use super::orchestrator::{Orchestrator, OrchestratorParts, OrchestratorSettings, PeriodicHandle};
use super::periodic::PeriodicScheduler;
use super::pool::{BackendFactory, ExecutionPool};

pub const SNAPSHOT_TASK: &str = "history-snapshot";
pub const EVICTION_TASK: &str = "registry-eviction";

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Builds an [`Engine`] from settings, optionally overriding the backend or
/// the resource probe.
pub struct EngineBuilder {
    settings: Settings,
    backend: Option<Arc<dyn ExecutionBackend>>,
    probe: Option<Arc<dyn SystemProbe>>,
}

impl EngineBuilder {
    /// Use `backend` for every pattern instead of resolving a mode. The pool
    /// shares it.
    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let settings = self.settings;

        let (backend, pool) = match self.backend {
            Some(backend) => {
                let pool = ExecutionPool::shared(Arc::clone(&backend));
                (backend, pool)
            }
            None => {
                let backend = select_backend(settings.executor.mode)?;
                let mode = backend.mode();
                let factory: BackendFactory = Arc::new(move || Ok(build_backend(mode)));
                (backend, ExecutionPool::new(settings.pool.size, factory))
            }
        };

        let registry = match &settings.history.path {
            Some(path) => RunRegistry::load(path.clone()).await?,
            None => RunRegistry::new(),
        };

        let broadcaster = match &settings.output.log_dir {
            Some(dir) => OutputBroadcaster::with_log_dir(settings.output.buffer_capacity, dir)?,
            None => OutputBroadcaster::new(settings.output.buffer_capacity),
        };

        let gate = match self.probe {
            Some(probe) => ResourceGate::with_probe(settings.resources, probe),
            None => ResourceGate::new(settings.resources),
        };

        let parts = OrchestratorParts {
            backend,
            gate,
            broadcaster: Arc::new(broadcaster),
            registry: Arc::new(registry),
            batch: Arc::new(BoundedBatchExecutor::new(settings.executor.max_concurrent)),
            pool: Arc::new(pool),
            scheduler: Arc::new(PeriodicScheduler::new()),
            settings: OrchestratorSettings {
                termination_timeout: settings.executor.termination_timeout,
                stop_timeout: settings.executor.stop_timeout,
                execution_timeout: settings.executor.execution_timeout,
            },
        };
        let orchestrator = Orchestrator::new(parts);

        register_housekeeping(&orchestrator, &settings)?;

        let mut periodic = Vec::with_capacity(settings.periodic.len());
        for module in &settings.periodic {
            let handle = orchestrator.register_periodic(
                &module.name,
                &module.request,
                module.interval,
                module.timeout,
                &BTreeMap::new(),
            )?;
            periodic.push(handle);
        }

        info!(
            mode = %orchestrator.backend().mode(),
            periodic = periodic.len(),
            history = ?settings.history.path,
            log_dir = ?settings.output.log_dir,
            "engine assembled"
        );

        Ok(Engine {
            settings,
            orchestrator,
            periodic,
        })
    }
}

fn register_housekeeping(orchestrator: &Orchestrator, settings: &Settings) -> Result<()> {
    let scheduler = orchestrator.scheduler();

    if orchestrator.registry().history_path().is_some() {
        let registry = Arc::clone(orchestrator.registry());
        scheduler.register(SNAPSHOT_TASK, settings.history.snapshot_interval, move || {
            let registry = Arc::clone(&registry);
            async move {
                if registry.snapshot().await? {
                    debug!("history snapshot written");
                }
                Ok(())
            }
        })?;
    }

    if settings.history.retention.is_none() {
        warn!("[history].retention is \"never\"; terminal runs and their output are kept until restart");
    }
    if let Some(retention) = settings.history.retention {
        let registry = Arc::clone(orchestrator.registry());
        let broadcaster = Arc::clone(orchestrator.broadcaster());
        scheduler.register(EVICTION_TASK, settings.history.eviction_interval, move || {
            let registry = Arc::clone(&registry);
            let broadcaster = Arc::clone(&broadcaster);
            async move {
                let evicted = registry.evict_older_than(retention, true);
                let mut dropped = 0usize;
                for run_id in broadcaster.run_ids() {
                    if broadcaster.is_closed(&run_id)
                        && !registry.contains(&run_id)
                        && broadcaster.cleanup_run(&run_id)
                    {
                        dropped += 1;
                    }
                }
                dropped += broadcaster.prune_idle();
                if evicted > 0 || dropped > 0 {
                    info!(evicted, buffers = dropped, "evicted expired runs");
                }
                Ok(())
            }
        })?;
    }

    Ok(())
}

/// The assembled service: settings, the orchestrator and the periodic
/// modules registered from configuration.
#[derive(Debug)]
pub struct Engine {
    settings: Settings,
    orchestrator: Orchestrator,
    periodic: Vec<PeriodicHandle>,
}

impl Engine {
    pub fn builder(settings: Settings) -> EngineBuilder {
        EngineBuilder {
            settings,
            backend: None,
            probe: None,
        }
    }

    pub async fn build(settings: Settings) -> Result<Self> {
        Self::builder(settings).build().await
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn periodic_modules(&self) -> &[PeriodicHandle] {
        &self.periodic
    }

    /// Start housekeeping and every configured periodic module. Returns
    /// how many loops were started.
    pub fn start_periodic_tasks(&self) -> usize {
        let started = self.orchestrator.scheduler().start_all();
        info!(started, "periodic tasks started");
        started
    }

    /// Stop accepting batch work, cancel active runs, stop periodic tasks,
    /// then persist history, flush logs and release backends.
    pub async fn shutdown(&self) -> Result<()> {
        let stop_timeout = self.settings.executor.stop_timeout;
        info!("engine shutting down");

        self.orchestrator.batch_executor().shutdown();

        let active = self.orchestrator.active_run_ids();
        for run_id in &active {
            if let Err(e) = self.orchestrator.cancel(run_id) {
                debug!(run_id = %run_id, error = %e, "run finished before cancellation");
            }
        }
        if !active.is_empty() {
            self.drain_active(stop_timeout + self.settings.executor.termination_timeout)
                .await;
        }

        if !self.orchestrator.scheduler().stop_all(stop_timeout).await {
            warn!("some periodic tasks did not stop in time");
        }

        let registry_result = self.orchestrator.registry().snapshot().await;
        self.orchestrator.broadcaster().flush().await;
        self.orchestrator.pool().cleanup().await;
        self.orchestrator.backend().cleanup().await;

        registry_result.map(|written| {
            if written {
                info!("final history snapshot written");
            }
        })
    }

    async fn drain_active(&self, limit: Duration) {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = self.orchestrator.active_run_ids().len();
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "runs still active at shutdown");
                return;
            }
            sleep(DRAIN_POLL).await;
        }
    }
}
