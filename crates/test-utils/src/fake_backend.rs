use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;

use modrun::errors::{ModrunError, Result};
use modrun::exec::{
    EXIT_CODE_UNKNOWN, ExecutionBackend, OutputStream, ProcessHandle, SpawnRequest,
    SpawnedProcess,
};
use modrun::types::{ExecutionMode, StreamSource};

/// What a fake "process" does once spawned.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit_code: i32,
    delay: Duration,
    hang: bool,
    spawn_error: Option<FakeSpawnError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FakeSpawnError {
    NotFound,
    Denied,
}

impl FakeScript {
    /// Exits 0 immediately with no output.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(mut self, line: &str) -> Self {
        self.stdout.push(line.to_string());
        self
    }

    pub fn stderr(mut self, line: &str) -> Self {
        self.stderr.push(line.to_string());
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Run this long before exiting.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Never exit on its own; only a kill ends it.
    pub fn hang_until_killed(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn not_found(mut self) -> Self {
        self.spawn_error = Some(FakeSpawnError::NotFound);
        self
    }

    pub fn permission_denied(mut self) -> Self {
        self.spawn_error = Some(FakeSpawnError::Denied);
        self
    }
}

#[derive(Debug, Default)]
struct Gauges {
    live: AtomicUsize,
    peak: AtomicUsize,
    killed: AtomicUsize,
}

/// A scriptable backend that never starts real processes.
///
/// Scripts are looked up by full command line first (`"prog a b"`), then by
/// program, then the default script applies.
#[derive(Debug, Default)]
pub struct FakeBackend {
    scripts: Mutex<HashMap<String, FakeScript>>,
    default_script: FakeScript,
    spawned: Mutex<Vec<SpawnRequest>>,
    next_id: AtomicU64,
    cleanups: AtomicUsize,
    gauges: Arc<Gauges>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script used when nothing more specific matches.
    pub fn with_default(script: FakeScript) -> Self {
        Self {
            default_script: script,
            ..Self::default()
        }
    }

    /// Register `script` for a program name or a full command line.
    pub fn script(self, key: &str, script: FakeScript) -> Self {
        self.set_script(key, script);
        self
    }

    pub fn set_script(&self, key: &str, script: FakeScript) {
        self.scripts.lock().insert(key.to_string(), script);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }

    pub fn spawned_requests(&self) -> Vec<SpawnRequest> {
        self.spawned.lock().clone()
    }

    /// Fake processes currently "running".
    pub fn live_count(&self) -> usize {
        self.gauges.live.load(Ordering::SeqCst)
    }

    /// Most fake processes ever running at once.
    pub fn peak_live(&self) -> usize {
        self.gauges.peak.load(Ordering::SeqCst)
    }

    pub fn killed_count(&self) -> usize {
        self.gauges.killed.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    fn script_for(&self, request: &SpawnRequest) -> FakeScript {
        let scripts = self.scripts.lock();
        scripts
            .get(&request.command_line())
            .or_else(|| scripts.get(&request.program))
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        let script = self.script_for(request);
        match script.spawn_error {
            Some(FakeSpawnError::NotFound) => {
                return Err(ModrunError::TargetNotFound(request.program.clone()));
            }
            Some(FakeSpawnError::Denied) => {
                return Err(ModrunError::SpawnFailure {
                    program: request.program.clone(),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
                });
            }
            None => {}
        }

        self.spawned.lock().push(request.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (handle, mut control) = ProcessHandle::new(id, None, &request.program);
        let (out_tx, stdout) = OutputStream::channel(StreamSource::Stdout);
        let (err_tx, stderr) = OutputStream::channel(StreamSource::Stderr);

        let gauges = Arc::clone(&self.gauges);
        let live = gauges.live.fetch_add(1, Ordering::SeqCst) + 1;
        gauges.peak.fetch_max(live, Ordering::SeqCst);

        tokio::spawn(async move {
            for line in &script.stdout {
                let _ = out_tx.send(line.clone());
            }
            for line in &script.stderr {
                let _ = err_tx.send(line.clone());
            }

            let code = if script.hang {
                control.kill_requested().await;
                gauges.killed.fetch_add(1, Ordering::SeqCst);
                EXIT_CODE_UNKNOWN
            } else {
                tokio::select! {
                    _ = sleep(script.delay) => script.exit_code,
                    true = control.kill_requested() => {
                        gauges.killed.fetch_add(1, Ordering::SeqCst);
                        EXIT_CODE_UNKNOWN
                    }
                }
            };

            drop(out_tx);
            drop(err_tx);
            gauges.live.fetch_sub(1, Ordering::SeqCst);
            control.report_exit(code);
        });

        Ok(SpawnedProcess {
            handle,
            stdout,
            stderr,
        })
    }

    async fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}
