// src/engine/pool.rs

//! Long-lived, shared execution backends.
//!
//! The lock only guards the alive check, lazy initialisation and the
//! round-robin cursor; it is released before a lease is handed out.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{ModrunError, Result};
use crate::exec::ExecutionBackend;

/// Creates the pool's backends on first use.
pub type BackendFactory = Arc<dyn Fn() -> Result<Arc<dyn ExecutionBackend>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub size: usize,
    pub initialized: bool,
    pub alive: bool,
    pub active_leases: usize,
    pub total_acquisitions: u64,
}

struct PoolState {
    alive: bool,
    backends: Vec<Arc<dyn ExecutionBackend>>,
    cursor: usize,
}

pub struct ExecutionPool {
    size: usize,
    factory: BackendFactory,
    state: Mutex<PoolState>,
    active: Arc<AtomicUsize>,
    acquisitions: AtomicU64,
}

impl fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("stats", &self.statistics())
            .finish_non_exhaustive()
    }
}

impl ExecutionPool {
    pub fn new(size: usize, factory: BackendFactory) -> Self {
        Self {
            size: size.max(1),
            factory,
            state: Mutex::new(PoolState {
                alive: true,
                backends: Vec::new(),
                cursor: 0,
            }),
            active: Arc::new(AtomicUsize::new(0)),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Pool handing out clones of one existing backend.
    pub fn shared(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self::new(1, Arc::new(move || Ok(Arc::clone(&backend))))
    }

    /// Lease a backend. Fails with `PoolShutDown` after [`cleanup`](Self::cleanup).
    pub fn acquire(&self) -> Result<PooledBackend> {
        let backend = {
            let mut state = self.state.lock();
            if !state.alive {
                return Err(ModrunError::PoolShutDown);
            }
            if state.backends.is_empty() {
                let mut created = Vec::with_capacity(self.size);
                for _ in 0..self.size {
                    created.push((self.factory)()?);
                }
                debug!(size = self.size, "execution pool initialised");
                state.backends = created;
            }
            let index = state.cursor % state.backends.len();
            state.cursor = (index + 1) % state.backends.len();
            Arc::clone(&state.backends[index])
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(PooledBackend {
            backend,
            active: Arc::clone(&self.active),
        })
    }

    /// Shut the pool down and clean up its backends. Idempotent.
    pub async fn cleanup(&self) {
        let backends = {
            let mut state = self.state.lock();
            if !state.alive {
                return;
            }
            state.alive = false;
            std::mem::take(&mut state.backends)
        };

        for backend in &backends {
            backend.cleanup().await;
        }
        info!(backends = backends.len(), "execution pool cleaned up");
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    pub fn statistics(&self) -> PoolStatistics {
        let (alive, initialized) = {
            let state = self.state.lock();
            (state.alive, !state.backends.is_empty())
        };
        PoolStatistics {
            size: self.size,
            initialized,
            alive,
            active_leases: self.active.load(Ordering::SeqCst),
            total_acquisitions: self.acquisitions.load(Ordering::Relaxed),
        }
    }
}

/// A leased backend; the lease ends when this is dropped.
pub struct PooledBackend {
    backend: Arc<dyn ExecutionBackend>,
    active: Arc<AtomicUsize>,
}

impl PooledBackend {
    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }
}

impl Deref for PooledBackend {
    type Target = dyn ExecutionBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl Drop for PooledBackend {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for PooledBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBackend")
            .field("backend", &self.backend)
            .finish()
    }
}
