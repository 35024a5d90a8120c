// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::model::{RawConfigFile, Settings};
use crate::errors::Result;

/// Load a configuration file and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; durations and thresholds are
/// checked by [`load_and_validate`].
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file and validate it into [`Settings`].
///
/// Relative paths in the file (log dir, history file, working dirs) are
/// resolved against the file's directory.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let raw_config = load_from_path(path)?;
    let settings = Settings::try_from(raw_config)?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(settings.resolve_paths(&config_root_dir(path)))
}

/// Like [`load_and_validate`], but with no explicit path a missing
/// default file yields the built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => load_and_validate(path),
        None => {
            let default = default_config_path();
            if default.exists() {
                load_and_validate(&default)
            } else {
                info!(path = %default.display(), "no config file; using defaults");
                Ok(Settings::default())
            }
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("modrun.toml")
}

/// - `configs/modrun.toml` → `configs`
/// - bare `modrun.toml` → the current working directory
fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}
