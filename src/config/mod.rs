// src/config/mod.rs

//! Configuration loading and validation for modrun.
//!
//! - `model.rs`: the TOML-backed raw model and the validated `Settings`.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: `RawConfigFile` → `Settings`.
//! - `duration.rs`: `"250ms"` / `"5s"` / `"2m"` / `"1h"` strings.

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{default_config_path, load_and_validate, load_from_path, load_or_default};
pub use model::{
    DEFAULT_RETENTION, ExecutorSettings, HistorySettings, OutputSettings, PeriodicModule,
    PoolSettings, RawConfigFile, Settings,
};
