mod common;
use crate::common::init_tracing;

use std::error::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use modrun::config::{DEFAULT_RETENTION, Settings, load_and_validate, load_from_path, load_or_default, parse_duration};
use modrun::errors::ErrorKind;
use modrun::types::ExecutionMode;

type TestResult = Result<(), Box<dyn Error>>;

const FULL_CONFIG: &str = r#"
[executor]
mode = "thread_backed"
max_concurrent = 8
termination_timeout = "2s"
execution_timeout = "10m"

[resources]
max_cpu_percent = 85.5
min_available_memory_mb = 512
sample_window = "250ms"

[output]
buffer_capacity = 200
log_dir = "logs"

[history]
path = "state/runs.json"
retention = "24h"
eviction_interval = "5m"

[pool]
size = 3

[[periodic]]
name = "heartbeat"
program = "./heartbeat.sh"
args = ["--quiet"]
working_dir = "scripts"
interval = "1m"
timeout = "30s"

[periodic.env]
REGION = "eu"
"#;

fn write_config(dir: &Path, contents: &str) -> Result<std::path::PathBuf, Box<dyn Error>> {
    let path = dir.join("modrun.toml");
    fs::write(&path, contents)?;
    Ok(path)
}

fn config_error_for(contents: &str) -> Result<String, Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), contents)?;
    let err = load_and_validate(&path).expect_err("config should be rejected");
    assert_eq!(err.kind(), ErrorKind::Config);
    Ok(err.to_string())
}

#[test]
fn full_config_is_parsed_and_validated() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), FULL_CONFIG)?;

    let settings = load_and_validate(&path)?;

    assert_eq!(settings.executor.mode, Some(ExecutionMode::ThreadBacked));
    assert_eq!(settings.executor.max_concurrent, 8);
    assert_eq!(settings.executor.termination_timeout, Duration::from_secs(2));
    assert_eq!(settings.executor.stop_timeout, Duration::from_secs(5));
    assert_eq!(settings.executor.execution_timeout, Some(Duration::from_secs(600)));
    assert_eq!(settings.resources.max_cpu_percent, Some(85.5));
    assert_eq!(settings.resources.min_available_memory_mb, Some(512));
    assert_eq!(settings.resources.sample_window, Duration::from_millis(250));
    assert_eq!(settings.output.buffer_capacity, 200);
    assert_eq!(settings.history.retention, Some(Duration::from_secs(24 * 3600)));
    assert_eq!(settings.history.eviction_interval, Duration::from_secs(300));
    assert_eq!(settings.pool.size, 3);

    assert_eq!(settings.periodic.len(), 1);
    let module = &settings.periodic[0];
    assert_eq!(module.name, "heartbeat");
    assert_eq!(module.interval, Duration::from_secs(60));
    assert_eq!(module.timeout, Some(Duration::from_secs(30)));
    assert_eq!(module.request.program, "./heartbeat.sh");
    assert_eq!(module.request.args, vec!["--quiet".to_string()]);
    assert_eq!(module.request.env, vec![("REGION".to_string(), "eu".to_string())]);
    Ok(())
}

#[test]
fn relative_paths_resolve_against_the_config_directory() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), FULL_CONFIG)?;

    let settings = load_and_validate(&path)?;

    assert_eq!(settings.output.log_dir, Some(dir.path().join("logs")));
    assert_eq!(settings.history.path, Some(dir.path().join("state/runs.json")));
    assert_eq!(
        settings.periodic[0].request.working_dir,
        Some(dir.path().join("scripts"))
    );
    Ok(())
}

#[test]
fn empty_file_gives_defaults() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), "")?;

    let settings = load_and_validate(&path)?;

    assert_eq!(settings, Settings::default());
    assert_eq!(settings.executor.max_concurrent, 4);
    assert_eq!(settings.pool.size, 1);
    assert!(settings.history.path.is_none());
    Ok(())
}

#[test]
fn explicit_missing_file_is_an_error() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let err = load_or_default(Some(dir.path().join("absent.toml").as_path())).expect_err("file is missing");

    assert_eq!(err.kind(), ErrorKind::Io);
    Ok(())
}

#[test]
fn unknown_keys_are_rejected_at_parse_time() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), "[executor]\nmax_parallel = 3\n")?;

    let err = load_from_path(&path).expect_err("unknown field");

    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("max_parallel"));
    Ok(())
}

#[test]
fn invalid_values_name_the_offending_field() -> TestResult {
    init_tracing();

    let msg = config_error_for("[resources]\nmax_cpu_percent = 120\n")?;
    assert!(msg.contains("[resources].max_cpu_percent"), "{msg}");

    let msg = config_error_for("[executor]\nmax_concurrent = 0\n")?;
    assert!(msg.contains("[executor].max_concurrent must be >= 1"), "{msg}");

    let msg = config_error_for("[executor]\ntermination_timeout = \"5\"\n")?;
    assert!(msg.contains("missing a unit"), "{msg}");

    let msg = config_error_for("[history]\nsnapshot_interval = \"0s\"\n")?;
    assert!(msg.contains("[history].snapshot_interval"), "{msg}");

    let msg = config_error_for("[output]\nbuffer_capacity = 0\n")?;
    assert!(msg.contains("[output].buffer_capacity"), "{msg}");

    let msg = config_error_for("[pool]\nsize = 0\n")?;
    assert!(msg.contains("[pool].size"), "{msg}");
    Ok(())
}

#[test]
fn periodic_modules_are_checked() -> TestResult {
    init_tracing();

    let duplicate = r#"
[[periodic]]
name = "tick"
program = "a"
interval = "1s"

[[periodic]]
name = "tick"
program = "b"
interval = "2s"
"#;
    let msg = config_error_for(duplicate)?;
    assert!(msg.contains("more than once"), "{msg}");

    let zero = "[[periodic]]\nname = \"tick\"\nprogram = \"a\"\ninterval = \"0ms\"\n";
    let msg = config_error_for(zero)?;
    assert!(msg.contains("greater than zero"), "{msg}");

    let no_program = "[[periodic]]\nname = \"tick\"\nprogram = \" \"\ninterval = \"1s\"\n";
    let msg = config_error_for(no_program)?;
    assert!(msg.contains("empty program"), "{msg}");
    Ok(())
}

#[test]
fn retention_defaults_to_a_day_and_can_be_turned_off() -> TestResult {
    init_tracing();
    assert_eq!(Settings::default().history.retention, Some(DEFAULT_RETENTION));
    assert_eq!(DEFAULT_RETENTION, Duration::from_secs(24 * 3600));

    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), "[history]\npath = \"runs.json\"\n")?;
    assert_eq!(load_and_validate(&path)?.history.retention, Some(DEFAULT_RETENTION));

    let path = write_config(dir.path(), "[history]\nretention = \"never\"\n")?;
    assert_eq!(load_and_validate(&path)?.history.retention, None);

    let msg = config_error_for("[history]\nretention = \"0s\"\n")?;
    assert!(msg.contains("[history].retention"), "{msg}");
    Ok(())
}

#[test]
fn durations_parse_with_units() {
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
    assert_eq!(parse_duration(" 2m "), Ok(Duration::from_secs(120)));
    assert_eq!(parse_duration("1H"), Ok(Duration::from_secs(3600)));

    assert!(parse_duration("").is_err());
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("3d").is_err());
    assert!(parse_duration("s").is_err());
    assert!(parse_duration("99999999999999999999h").is_err());
}
