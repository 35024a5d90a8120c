// src/resources/mod.rs

//! Resource-based admission control.
//!
//! The gate is consulted once per execution attempt. It takes no
//! reservation, so two attempts admitted back to back may together exceed a
//! threshold; that race is accepted.

pub mod probe;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{ModrunError, Result};

pub use probe::{ProcProbe, SystemProbe};

/// Default CPU averaging window.
pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

/// Admission thresholds. `None` disables a check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    /// Deny when CPU usage is above this percentage.
    pub max_cpu_percent: Option<f32>,
    /// Deny when available memory is below this many MiB.
    pub min_available_memory_mb: Option<u64>,
    pub sample_window: Duration,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            max_cpu_percent: None,
            min_available_memory_mb: None,
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

/// One reading of the host metrics the gate cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: Option<f32>,
    pub available_memory_bytes: Option<u64>,
}

impl ResourceSample {
    pub fn available_memory_mb(&self) -> Option<u64> {
        self.available_memory_bytes.map(|b| b / (1024 * 1024))
    }
}

#[derive(Debug, Clone)]
pub struct ResourceGate {
    thresholds: ResourceThresholds,
    probe: Arc<dyn SystemProbe>,
}

impl ResourceGate {
    pub fn new(thresholds: ResourceThresholds) -> Self {
        Self::with_probe(thresholds, Arc::new(ProcProbe::new()))
    }

    pub fn with_probe(thresholds: ResourceThresholds, probe: Arc<dyn SystemProbe>) -> Self {
        Self { thresholds, probe }
    }

    /// A gate that admits everything without sampling.
    pub fn disabled() -> Self {
        Self::new(ResourceThresholds::default())
    }

    pub fn thresholds(&self) -> &ResourceThresholds {
        &self.thresholds
    }

    /// Read the current metrics.
    ///
    /// CPU is only sampled when a CPU threshold is configured or when called
    /// directly, since it costs one sample window of sleeping.
    pub async fn sample(&self) -> ResourceSample {
        self.sample_metrics(true, true).await
    }

    async fn sample_metrics(&self, cpu: bool, memory: bool) -> ResourceSample {
        let cpu_percent = if cpu {
            self.probe.cpu_percent(self.thresholds.sample_window).await
        } else {
            None
        };
        let available_memory_bytes = if memory {
            self.probe.available_memory_bytes().await
        } else {
            None
        };
        ResourceSample {
            cpu_percent,
            available_memory_bytes,
        }
    }

    /// Check the configured thresholds, returning `ResourceDenied` naming
    /// the first violated metric.
    pub async fn check(&self) -> Result<()> {
        let ResourceThresholds {
            max_cpu_percent,
            min_available_memory_mb,
            ..
        } = self.thresholds;

        if max_cpu_percent.is_none() && min_available_memory_mb.is_none() {
            return Ok(());
        }

        let sample = self
            .sample_metrics(max_cpu_percent.is_some(), min_available_memory_mb.is_some())
            .await;

        if let Some(floor_mb) = min_available_memory_mb {
            match sample.available_memory_mb() {
                Some(available) if available < floor_mb => {
                    warn!(
                        available_mb = available,
                        floor_mb, "admission denied: available memory below floor"
                    );
                    return Err(ModrunError::ResourceDenied {
                        metric: "available memory".to_string(),
                        value: format!("{available} MiB (minimum {floor_mb} MiB)"),
                    });
                }
                Some(_) => {}
                None => debug!("available memory unknown on this host; admitting"),
            }
        }

        if let Some(ceiling) = max_cpu_percent {
            match sample.cpu_percent {
                Some(cpu) if cpu > ceiling => {
                    warn!(cpu_percent = cpu, ceiling, "admission denied: CPU usage above ceiling");
                    return Err(ModrunError::ResourceDenied {
                        metric: "cpu".to_string(),
                        value: format!("{cpu:.1}% (maximum {ceiling:.1}%)"),
                    });
                }
                Some(_) => {}
                None => debug!("CPU usage unknown on this host; admitting"),
            }
        }

        Ok(())
    }

    /// `check` as a plain yes/no.
    pub async fn admit(&self) -> bool {
        self.check().await.is_ok()
    }
}
