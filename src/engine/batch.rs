// src/engine/batch.rs

//! Concurrency-limited batch runner.
//!
//! A counting semaphore is acquired in input order before each item is
//! spawned onto its own task, so at most `max_concurrent` items run at once.
//! Per-item failures (errors and panics) become failed results; only
//! infrastructure failures reach the caller as `Err`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ErrorKind, ModrunError, Result};

/// One unit of batch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem<P> {
    pub id: String,
    pub payload: P,
}

impl<P> WorkItem<P> {
    pub fn new(id: impl Into<String>, payload: P) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Outcome of one item, in the same position as its input.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResult<T> {
    pub id: String,
    pub success: bool,
    pub output: Option<T>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl<T> BatchItemResult<T> {
    fn succeeded(id: String, output: T) -> Self {
        Self {
            id,
            success: true,
            output: Some(output),
            error: None,
            error_kind: None,
        }
    }

    fn failed(id: String, error: String, kind: ErrorKind) -> Self {
        Self {
            id,
            success: false,
            output: None,
            error: Some(error),
            error_kind: Some(kind),
        }
    }
}

#[derive(Debug)]
pub struct BoundedBatchExecutor {
    default_limit: usize,
    shutdown: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl BoundedBatchExecutor {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit: default_limit.max(1),
            shutdown: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Items currently executing across all batches.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest `in_flight` value observed since creation or the last reset.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(self.in_flight(), Ordering::SeqCst);
    }

    /// Refuse new batches and abort the in-flight items of running ones.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("batch executor shutting down");
        }
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `callable` over `items` with at most `max_concurrent` (or the
    /// executor default) executing at once.
    pub async fn run_batch<P, T, F, Fut>(
        &self,
        items: Vec<WorkItem<P>>,
        callable: F,
        max_concurrent: Option<usize>,
    ) -> Result<Vec<BatchItemResult<T>>>
    where
        P: Send + 'static,
        T: Send + 'static,
        F: Fn(WorkItem<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(ModrunError::ExecutorShutDown);
        }
        let limit = max_concurrent.unwrap_or(self.default_limit);
        if limit == 0 {
            return Err(ModrunError::InvalidRequest(
                "max_concurrent must be at least 1".to_string(),
            ));
        }

        let total = items.len();
        info!(items = total, limit, "starting batch");

        let semaphore = Arc::new(Semaphore::new(limit));
        let callable = Arc::new(callable);
        let mut ids = Vec::with_capacity(total);
        let mut set = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            ids.push(item.id.clone());

            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    warn!(aborted = set.len(), "shutdown while batch waited for a slot");
                    set.abort_all();
                    return Err(ModrunError::ExecutorShutDown);
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|_| ModrunError::ExecutorShutDown)?
                }
            };

            let callable = Arc::clone(&callable);
            let gauge = InFlight::enter(&self.in_flight, &self.peak);
            set.spawn(async move {
                let _permit = permit;
                let _gauge = gauge;
                let outcome = AssertUnwindSafe(async move { (*callable)(item).await })
                    .catch_unwind()
                    .await;
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<BatchItemResult<T>>> = (0..total).map(|_| None).collect();
        loop {
            let joined = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    warn!(aborted = set.len(), "shutdown during batch; aborting in-flight items");
                    set.abort_all();
                    return Err(ModrunError::ExecutorShutDown);
                }
                joined = set.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((index, Ok(Ok(output)))) => {
                    slots[index] = Some(BatchItemResult::succeeded(ids[index].clone(), output));
                }
                Ok((index, Ok(Err(e)))) => {
                    debug!(item = %ids[index], error = %e, "batch item failed");
                    slots[index] = Some(BatchItemResult::failed(ids[index].clone(), e.to_string(), e.kind()));
                }
                Ok((index, Err(panic))) => {
                    let message = panic_message(panic.as_ref());
                    warn!(item = %ids[index], panic = %message, "batch item panicked");
                    slots[index] = Some(BatchItemResult::failed(
                        ids[index].clone(),
                        format!("item panicked: {message}"),
                        ErrorKind::Panicked,
                    ));
                }
                Err(e) => warn!(error = %e, "batch task did not complete"),
            }
        }

        let results: Vec<BatchItemResult<T>> = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, id)| {
                slot.unwrap_or_else(|| {
                    BatchItemResult::failed(id, "item task did not complete".to_string(), ErrorKind::Other)
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.success).count();
        info!(items = total, failed, "batch finished");
        Ok(results)
    }
}

impl Default for BoundedBatchExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

pub const DEFAULT_MAX_CONCURRENT: usize = 4;

struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
