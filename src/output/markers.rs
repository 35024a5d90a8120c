// src/output/markers.rs

//! Textual markers modules print to signal severity and progress.
//!
//! Parsing is best-effort: an unrecognised line is `Info` with no progress.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::Severity;

#[allow(clippy::expect_used)]
static BRACKET_LEVEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(debug|info|warn|warning|error|critical|fatal)\]")
        .expect("constant regex pattern is valid")
});

#[allow(clippy::expect_used)]
static PREFIX_LEVEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(debug|info|warn|warning|error|critical|fatal)\s*:")
        .expect("constant regex pattern is valid")
});

// `PROGRESS: 42%`, `progress: 42`, `[PROGRESS] 42`, `[progress] 42%`
#[allow(clippy::expect_used)]
static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\[progress\]|progress:)\s*(\d{1,3}(?:\.\d+)?)\s*%?")
        .expect("constant regex pattern is valid")
});

/// Severity of one output line.
pub fn parse_severity(text: &str) -> Severity {
    BRACKET_LEVEL
        .captures(text)
        .or_else(|| PREFIX_LEVEL.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| severity_from_word(m.as_str()))
        .unwrap_or_default()
}

/// Progress percentage announced by a line, clamped to 0..=100.
pub fn parse_progress(text: &str) -> Option<u8> {
    let caps = PROGRESS.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(value.clamp(0.0, 100.0) as u8)
}

fn severity_from_word(word: &str) -> Severity {
    match word.to_ascii_lowercase().as_str() {
        "debug" => Severity::Debug,
        "warn" | "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" | "fatal" => Severity::Critical,
        _ => Severity::Info,
    }
}
