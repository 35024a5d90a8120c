#![allow(dead_code)]

use std::time::Duration;

use modrun::errors::Result;
use modrun::registry::{Run, RunRegistry};

pub use modrun_test_utils::builders;
pub use modrun_test_utils::{FakeBackend, FakeScript, FixedProbe, init_tracing, with_timeout};

/// Poll until the run is terminal, then return it.
pub async fn wait_for_terminal(registry: &RunRegistry, run_id: &str) -> Result<Run> {
    loop {
        let run = registry.get(run_id)?;
        if run.is_terminal() {
            return Ok(run);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `condition` every 10ms until it holds.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Whether `pid` names a live process. A zombie waiting for its reaper
/// counts as dead.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z"),
        Err(_) => false,
    }
}
