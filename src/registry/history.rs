// src/registry/history.rs

//! On-disk run history: one JSON document, replaced atomically.
//!
//! Layout on disk:
//! - `<path>`        current snapshot
//! - `<path>.tmp`    snapshot being written
//! - `<path>.bak.N`  previous snapshots, N = 1 (newest) ..= `BACKUP_COUNT`

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{ModrunError, Result};

use super::run::Run;

pub const HISTORY_VERSION: u32 = 1;
pub const BACKUP_COUNT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryFile {
    pub v: u32,
    pub saved_at: DateTime<Utc>,
    pub runs: Vec<Run>,
}

pub fn backup_path(path: &Path, n: usize) -> PathBuf {
    suffixed(path, &format!("bak.{n}"))
}

fn tmp_path(path: &Path) -> PathBuf {
    suffixed(path, "tmp")
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(suffix);
    PathBuf::from(os)
}

/// Write `runs` to `path` via a temp file, keeping older copies as backups.
///
/// Blocking; call from the blocking pool.
pub fn write_snapshot(path: &Path, runs: Vec<Run>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let doc = HistoryFile {
        v: HISTORY_VERSION,
        saved_at: Utc::now(),
        runs,
    };

    let tmp = tmp_path(path);
    {
        let file = File::create(&tmp)?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, &doc)?;
        out.flush()?;
        out.get_ref().sync_all()?;
    }

    if path.exists() {
        rotate_backups(path)?;
    }
    fs::rename(&tmp, path)?;

    debug!(path = %path.display(), runs = doc.runs.len(), "wrote run history snapshot");
    Ok(())
}

fn rotate_backups(path: &Path) -> io::Result<()> {
    let oldest = backup_path(path, BACKUP_COUNT);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..BACKUP_COUNT).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    fs::copy(path, backup_path(path, 1))?;
    Ok(())
}

/// Read a history file. `Ok(None)` when neither it nor any backup exists.
///
/// A corrupt current file falls back to the newest readable backup.
pub fn read_history(path: &Path) -> Result<Option<HistoryFile>> {
    let mut first_error: Option<ModrunError> = None;
    let candidates = std::iter::once(path.to_path_buf())
        .chain((1..=BACKUP_COUNT).map(|n| backup_path(path, n)));

    for candidate in candidates {
        if !candidate.exists() {
            continue;
        }
        match read_one(&candidate) {
            Ok(doc) => {
                if candidate != path {
                    warn!(path = %candidate.display(), "restored run history from backup");
                }
                return Ok(Some(doc));
            }
            Err(e) => {
                warn!(path = %candidate.display(), error = %e, "unreadable run history file");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

fn read_one(path: &Path) -> Result<HistoryFile> {
    let reader = BufReader::new(File::open(path)?);
    let doc: HistoryFile = serde_json::from_reader(reader)?;
    if doc.v != HISTORY_VERSION {
        return Err(ModrunError::ConfigError(format!(
            "unsupported history version {} in {} (expected {HISTORY_VERSION})",
            doc.v,
            path.display()
        )));
    }
    Ok(doc)
}
