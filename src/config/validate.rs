// src/config/validate.rs

use std::collections::HashSet;
use std::time::Duration;

use crate::config::duration::parse_duration;
use crate::config::model::{
    DEFAULT_RETENTION, ExecutorSettings, HistorySettings, OutputSettings, PeriodicModule,
    PoolSettings, RawConfigFile, RawExecutorSection, RawHistorySection, RawOutputSection,
    RawPeriodicModule, RawResourcesSection, Settings,
};
use crate::errors::{ModrunError, Result};
use crate::exec::SpawnRequest;
use crate::resources::{DEFAULT_SAMPLE_WINDOW, ResourceThresholds};

impl TryFrom<RawConfigFile> for Settings {
    type Error = ModrunError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        Ok(Settings {
            executor: validate_executor(&raw.executor)?,
            resources: validate_resources(&raw.resources)?,
            output: validate_output(&raw.output)?,
            history: validate_history(&raw.history)?,
            pool: PoolSettings {
                size: validate_pool_size(raw.pool.size)?,
            },
            periodic: validate_periodic(&raw.periodic)?,
        })
    }
}

fn config_error(msg: impl Into<String>) -> ModrunError {
    ModrunError::ConfigError(msg.into())
}

fn duration_field(field: &str, value: Option<&str>) -> Result<Option<Duration>> {
    value
        .map(|s| parse_duration(s).map_err(|e| config_error(format!("{field}: {e}"))))
        .transpose()
}

fn non_zero_duration(field: &str, value: Option<&str>, default: Duration) -> Result<Duration> {
    let d = duration_field(field, value)?.unwrap_or(default);
    if d.is_zero() {
        return Err(config_error(format!("{field} must be greater than zero")));
    }
    Ok(d)
}

fn validate_executor(raw: &RawExecutorSection) -> Result<ExecutorSettings> {
    let defaults = ExecutorSettings::default();

    let max_concurrent = raw.max_concurrent.unwrap_or(defaults.max_concurrent);
    if max_concurrent == 0 {
        return Err(config_error(
            "[executor].max_concurrent must be >= 1 (got 0)",
        ));
    }

    let execution_timeout =
        duration_field("[executor].execution_timeout", raw.execution_timeout.as_deref())?;
    if execution_timeout.is_some_and(|d| d.is_zero()) {
        return Err(config_error(
            "[executor].execution_timeout must be greater than zero",
        ));
    }

    Ok(ExecutorSettings {
        mode: raw.mode,
        max_concurrent,
        termination_timeout: non_zero_duration(
            "[executor].termination_timeout",
            raw.termination_timeout.as_deref(),
            defaults.termination_timeout,
        )?,
        stop_timeout: non_zero_duration(
            "[executor].stop_timeout",
            raw.stop_timeout.as_deref(),
            defaults.stop_timeout,
        )?,
        execution_timeout,
    })
}

fn validate_resources(raw: &RawResourcesSection) -> Result<ResourceThresholds> {
    if let Some(cpu) = raw.max_cpu_percent {
        if !(0.0..=100.0).contains(&cpu) {
            return Err(config_error(format!(
                "[resources].max_cpu_percent must be between 0 and 100 (got {cpu})"
            )));
        }
    }

    Ok(ResourceThresholds {
        max_cpu_percent: raw.max_cpu_percent,
        min_available_memory_mb: raw.min_available_memory_mb,
        sample_window: non_zero_duration(
            "[resources].sample_window",
            raw.sample_window.as_deref(),
            DEFAULT_SAMPLE_WINDOW,
        )?,
    })
}

fn validate_output(raw: &RawOutputSection) -> Result<OutputSettings> {
    let defaults = OutputSettings::default();
    let buffer_capacity = raw.buffer_capacity.unwrap_or(defaults.buffer_capacity);
    if buffer_capacity == 0 {
        return Err(config_error(
            "[output].buffer_capacity must be >= 1 (got 0)",
        ));
    }
    Ok(OutputSettings {
        buffer_capacity,
        log_dir: raw.log_dir.clone(),
    })
}

fn validate_history(raw: &RawHistorySection) -> Result<HistorySettings> {
    let defaults = HistorySettings::default();
    Ok(HistorySettings {
        path: raw.path.clone(),
        snapshot_interval: non_zero_duration(
            "[history].snapshot_interval",
            raw.snapshot_interval.as_deref(),
            defaults.snapshot_interval,
        )?,
        retention: match raw.retention.as_deref().map(str::trim) {
            Some("never") => None,
            Some(_) => Some(non_zero_duration(
                "[history].retention",
                raw.retention.as_deref(),
                DEFAULT_RETENTION,
            )?),
            None => defaults.retention,
        },
        eviction_interval: non_zero_duration(
            "[history].eviction_interval",
            raw.eviction_interval.as_deref(),
            defaults.eviction_interval,
        )?,
    })
}

fn validate_pool_size(size: Option<usize>) -> Result<usize> {
    match size {
        Some(0) => Err(config_error("[pool].size must be >= 1 (got 0)")),
        Some(n) => Ok(n),
        None => Ok(PoolSettings::default().size),
    }
}

fn validate_periodic(raw: &[RawPeriodicModule]) -> Result<Vec<PeriodicModule>> {
    let mut seen = HashSet::new();
    let mut modules = Vec::with_capacity(raw.len());

    for module in raw {
        let name = module.name.trim();
        if name.is_empty() {
            return Err(config_error("[[periodic]] entries need a non-empty name"));
        }
        if !seen.insert(name.to_string()) {
            return Err(config_error(format!(
                "[[periodic]] name '{name}' is used more than once"
            )));
        }
        if module.program.trim().is_empty() {
            return Err(config_error(format!(
                "[[periodic]] '{name}' has an empty program"
            )));
        }

        let interval = parse_duration(&module.interval)
            .map_err(|e| config_error(format!("[[periodic]] '{name}'.interval: {e}")))?;
        if interval.is_zero() {
            return Err(config_error(format!(
                "[[periodic]] '{name}'.interval must be greater than zero"
            )));
        }
        let timeout = duration_field(
            &format!("[[periodic]] '{name}'.timeout"),
            module.timeout.as_deref(),
        )?;

        let mut request = SpawnRequest::new(&module.program).args(module.args.iter().cloned());
        if let Some(dir) = &module.working_dir {
            request = request.current_dir(dir);
        }
        for (key, value) in &module.env {
            request = request.env(key, value);
        }

        modules.push(PeriodicModule {
            name: name.to_string(),
            request,
            interval,
            timeout,
        });
    }

    Ok(modules)
}
