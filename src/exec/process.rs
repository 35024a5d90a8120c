// src/exec/process.rs

//! Mode-independent process plumbing: handles, output streams, line pumps.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::types::StreamSource;

/// Exit code reported when the OS gives none (killed by a signal, lost
/// supervisor, spawn failure recorded on a run).
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// Shared handle to one spawned process.
///
/// Cloning is cheap; every clone observes the same exit status.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: u64,
    pid: Option<u32>,
    program: Arc<str>,
    exit_rx: watch::Receiver<Option<i32>>,
    kill_tx: mpsc::UnboundedSender<()>,
}

/// The supervisor's side of a [`ProcessHandle`].
///
/// Backends keep this next to the process they launched: they report the
/// exit code through it and receive kill requests from it.
#[derive(Debug)]
pub struct ProcessControl {
    exit_tx: watch::Sender<Option<i32>>,
    pub(crate) kill_rx: mpsc::UnboundedReceiver<()>,
}

impl ProcessControl {
    pub fn report_exit(&self, code: i32) {
        // send_replace never fails, even with every handle dropped.
        self.exit_tx.send_replace(Some(code));
    }

    /// Resolves when a kill is requested. Returns false if every handle is
    /// gone, so no request can arrive any more.
    pub async fn kill_requested(&mut self) -> bool {
        self.kill_rx.recv().await.is_some()
    }
}

impl ProcessHandle {
    pub fn new(id: u64, pid: Option<u32>, program: &str) -> (Self, ProcessControl) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            pid,
            program: Arc::from(program),
            exit_rx,
            kill_tx,
        };
        (handle, ProcessControl { exit_tx, kill_rx })
    }

    /// Backend-local identifier, unique per backend instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// OS process id, if the mode produced a real process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit code if the process has already exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Wait for the process to exit.
    ///
    /// If the supervisor disappears without reporting, the exit code is
    /// [`EXIT_CODE_UNKNOWN`].
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(EXIT_CODE_UNKNOWN),
            Err(_) => {
                warn!(program = %self.program, "process supervisor vanished without an exit code");
                EXIT_CODE_UNKNOWN
            }
        }
    }

    /// Ask the supervisor to kill the process. Returns false if the
    /// supervisor is already gone.
    pub(crate) fn request_kill(&self) -> bool {
        self.kill_tx.send(()).is_ok()
    }
}

/// A stream of decoded output lines from one pipe of a process.
#[derive(Debug)]
pub struct OutputStream {
    source: StreamSource,
    rx: mpsc::UnboundedReceiver<String>,
}

impl OutputStream {
    /// A stream fed through the returned sender; it ends when the sender
    /// is dropped.
    pub fn channel(source: StreamSource) -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { source, rx })
    }

    /// A stream that is already finished.
    pub fn empty(source: StreamSource) -> Self {
        let (_tx, stream) = Self::channel(source);
        stream
    }

    /// Build a stream from lines already in memory.
    pub fn from_lines<I, S>(source: StreamSource, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, stream) = Self::channel(source);
        for line in lines {
            let _ = tx.send(line.into());
        }
        stream
    }

    pub fn source(&self) -> StreamSource {
        self.source
    }

    /// Next line, or `None` once the pipe is closed and drained.
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain the stream to its end.
    pub async fn collect_lines(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await {
            lines.push(line);
        }
        lines
    }
}

/// Live processes spawned by one backend, so `cleanup` can reach them.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, ProcessHandle>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn track(&self, handle: &ProcessHandle) {
        let mut live = self.live.lock();
        live.retain(|_, h| !h.has_exited());
        live.insert(handle.id(), handle.clone());
    }

    /// Number of tracked processes that have not exited yet.
    pub fn live_count(&self) -> usize {
        self.live.lock().values().filter(|h| !h.has_exited()).count()
    }

    /// Force-kill every live process and forget all of them.
    pub fn kill_all(&self) -> usize {
        let handles: Vec<ProcessHandle> = self.live.lock().drain().map(|(_, h)| h).collect();
        let mut killed = 0;
        for handle in handles.iter().filter(|h| !h.has_exited()) {
            debug!(program = %handle.program(), pid = ?handle.pid(), "killing live process during cleanup");
            if handle.request_kill() {
                killed += 1;
            }
        }
        killed
    }
}

pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_CODE_UNKNOWN)
}

/// Strip the line terminator and decode lossily.
pub(crate) fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    while end > 0 && (buf[end - 1] == b'\n' || buf[end - 1] == b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Spawn a Tokio task forwarding lines from an async pipe.
///
/// The pipe is drained to EOF even if the receiver goes away, so a chatty
/// child never blocks on a full pipe buffer.
pub(crate) fn spawn_async_pump<R>(reader: R, tx: mpsc::UnboundedSender<String>, program: Arc<str>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let _ = tx.send(decode_line(&buf));
                }
                Err(e) => {
                    debug!(program = %program, error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    });
}

/// Blocking counterpart of [`spawn_async_pump`], run on the runtime's
/// bounded blocking pool.
pub(crate) fn spawn_blocking_pump<R>(
    runtime: &tokio::runtime::Handle,
    reader: R,
    tx: mpsc::UnboundedSender<String>,
    program: Arc<str>,
) where
    R: std::io::Read + Send + 'static,
{
    runtime.spawn_blocking(move || {
        let mut reader = std::io::BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let _ = tx.send(decode_line(&buf));
                }
                Err(e) => {
                    debug!(program = %program, error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    });
}
