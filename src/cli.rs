// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::parse_duration;
use crate::engine::Pattern;
use crate::registry::RunStatus;

/// Command-line arguments for `modrun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "modrun",
    version,
    about = "Launch, monitor and stream output from external modules.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `modrun.toml` in the current working directory, or built-in
    /// defaults when that file does not exist.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `MODRUN_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute one module.
    Exec(ExecArgs),
    /// Run one module over several argument sets concurrently.
    Batch(BatchArgs),
    /// List runs recorded in the history file.
    Runs(RunsArgs),
    /// Run configured periodic modules until Ctrl-C.
    Serve,
    /// Print the detected execution mode and a resource sample.
    Probe,
}

#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    /// Force an execution pattern instead of letting the advisor pick.
    #[arg(long, value_name = "PATTERN")]
    pub pattern: Option<Pattern>,

    /// Print output live as the module produces it.
    #[arg(long)]
    pub stream: bool,

    /// Start the module and poll until it finishes.
    #[arg(long)]
    pub background: bool,

    /// Use a pooled backend.
    #[arg(long)]
    pub pooled: bool,

    /// Kill the module after this long (e.g. "30s").
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Working directory for the module.
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Program followed by its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct BatchArgs {
    /// Concurrency ceiling for this batch.
    #[arg(long, value_name = "N")]
    pub max_concurrent: Option<usize>,

    /// Extra arguments for one item, whitespace-separated. Repeat per item.
    #[arg(long = "item", value_name = "ARGS", required = true)]
    pub items: Vec<String>,

    /// Per-item timeout (e.g. "30s").
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Program followed by arguments shared by every item.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RunsArgs {
    /// Only runs of this program.
    #[arg(long)]
    pub target: Option<String>,

    /// Only runs in this status.
    #[arg(long)]
    pub status: Option<RunStatus>,

    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
