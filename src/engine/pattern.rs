// src/engine/pattern.rs

//! Execution patterns, caller options and the pure pattern advisor.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ModrunError, Result};
use crate::exec::SpawnRequest;

use super::batch::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Simple,
    Streaming,
    BatchConcurrent,
    FireAndForget,
    Periodic,
    Pooled,
}

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::Simple => "simple",
            Pattern::Streaming => "streaming",
            Pattern::BatchConcurrent => "batch_concurrent",
            Pattern::FireAndForget => "fire_and_forget",
            Pattern::Periodic => "periodic",
            Pattern::Pooled => "pooled",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pattern {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "simple" => Ok(Pattern::Simple),
            "streaming" | "stream" => Ok(Pattern::Streaming),
            "batch_concurrent" | "batch" => Ok(Pattern::BatchConcurrent),
            "fire_and_forget" | "background" => Ok(Pattern::FireAndForget),
            "periodic" => Ok(Pattern::Periodic),
            "pooled" => Ok(Pattern::Pooled),
            other => Err(format!(
                "invalid pattern: {other} (expected simple, streaming, batch_concurrent, fire_and_forget, periodic or pooled)"
            )),
        }
    }
}

/// What the caller asked for. Hints select a pattern when `pattern` is unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOptions {
    pub pattern: Option<Pattern>,
    pub stream: bool,
    pub background: bool,
    pub pooled: bool,
    /// Per-item argument lists, appended to the target's own arguments.
    pub batch_items: Option<Vec<WorkItem<Vec<String>>>>,
    pub max_concurrent: Option<usize>,
    pub interval: Option<Duration>,
    /// Name for a periodic task; defaults to the program name.
    pub task_name: Option<String>,
    pub timeout: Option<Duration>,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn stream(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn pooled(mut self) -> Self {
        self.pooled = true;
        self
    }

    pub fn batch(mut self, items: Vec<WorkItem<Vec<String>>>) -> Self {
        self.batch_items = Some(items);
        self
    }

    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = Some(limit);
        self
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Patterns implied by the hints that are set, in advisor priority order.
    fn hinted(&self) -> Vec<Pattern> {
        let mut hinted = Vec::new();
        if self.interval.is_some() {
            hinted.push(Pattern::Periodic);
        }
        if self.batch_items.is_some() {
            hinted.push(Pattern::BatchConcurrent);
        }
        if self.stream {
            hinted.push(Pattern::Streaming);
        }
        if self.background {
            hinted.push(Pattern::FireAndForget);
        }
        if self.pooled {
            hinted.push(Pattern::Pooled);
        }
        hinted
    }
}

/// Pick a pattern from the hints alone.
///
/// interval → Periodic, batch items → BatchConcurrent, stream → Streaming,
/// background → FireAndForget, pooled → Pooled, otherwise Simple.
pub fn advise(options: &ExecutionOptions) -> Pattern {
    options.hinted().first().copied().unwrap_or(Pattern::Simple)
}

/// A validated request: one variant per pattern, carrying only its fields.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternRequest {
    Simple {
        timeout: Option<Duration>,
    },
    Streaming {
        timeout: Option<Duration>,
    },
    BatchConcurrent {
        items: Vec<WorkItem<Vec<String>>>,
        max_concurrent: Option<usize>,
        timeout: Option<Duration>,
    },
    FireAndForget {
        timeout: Option<Duration>,
    },
    Periodic {
        name: String,
        interval: Duration,
        timeout: Option<Duration>,
    },
    Pooled {
        timeout: Option<Duration>,
    },
}

impl PatternRequest {
    /// Validate `options` for `target`.
    ///
    /// An explicit pattern may not be combined with another pattern's
    /// hints, and pattern-specific fields must belong to the chosen pattern.
    pub fn from_options(target: &SpawnRequest, options: &ExecutionOptions) -> Result<Self> {
        if target.program.trim().is_empty() {
            return Err(ModrunError::InvalidRequest("target program is empty".to_string()));
        }

        let pattern = match options.pattern {
            Some(explicit) => {
                if let Some(other) = options.hinted().into_iter().find(|p| *p != explicit) {
                    return Err(ModrunError::InvalidRequest(format!(
                        "pattern {explicit} cannot be combined with options for {other}"
                    )));
                }
                explicit
            }
            None => advise(options),
        };

        if options.max_concurrent.is_some() && pattern != Pattern::BatchConcurrent {
            return Err(ModrunError::InvalidRequest(format!(
                "max_concurrent only applies to batch_concurrent, not {pattern}"
            )));
        }
        if options.task_name.is_some() && pattern != Pattern::Periodic {
            return Err(ModrunError::InvalidRequest(format!(
                "task_name only applies to periodic, not {pattern}"
            )));
        }
        if options.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ModrunError::InvalidRequest("timeout must be non-zero".to_string()));
        }

        let timeout = options.timeout;
        let request = match pattern {
            Pattern::Simple => PatternRequest::Simple { timeout },
            Pattern::Streaming => PatternRequest::Streaming { timeout },
            Pattern::FireAndForget => PatternRequest::FireAndForget { timeout },
            Pattern::Pooled => PatternRequest::Pooled { timeout },
            Pattern::BatchConcurrent => {
                let items = options.batch_items.clone().ok_or_else(|| {
                    ModrunError::InvalidRequest("batch_concurrent requires batch items".to_string())
                })?;
                if options.max_concurrent == Some(0) {
                    return Err(ModrunError::InvalidRequest(
                        "max_concurrent must be at least 1".to_string(),
                    ));
                }
                PatternRequest::BatchConcurrent {
                    items,
                    max_concurrent: options.max_concurrent,
                    timeout,
                }
            }
            Pattern::Periodic => {
                let interval = options.interval.ok_or_else(|| {
                    ModrunError::InvalidRequest("periodic requires an interval".to_string())
                })?;
                if interval.is_zero() {
                    return Err(ModrunError::InvalidRequest(
                        "periodic interval must be non-zero".to_string(),
                    ));
                }
                PatternRequest::Periodic {
                    name: options
                        .task_name
                        .clone()
                        .unwrap_or_else(|| target.program.clone()),
                    interval,
                    timeout,
                }
            }
        };
        Ok(request)
    }

    pub fn pattern(&self) -> Pattern {
        match self {
            PatternRequest::Simple { .. } => Pattern::Simple,
            PatternRequest::Streaming { .. } => Pattern::Streaming,
            PatternRequest::BatchConcurrent { .. } => Pattern::BatchConcurrent,
            PatternRequest::FireAndForget { .. } => Pattern::FireAndForget,
            PatternRequest::Periodic { .. } => Pattern::Periodic,
            PatternRequest::Pooled { .. } => Pattern::Pooled,
        }
    }
}
