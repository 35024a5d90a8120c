// src/output/mod.rs

//! Live output capture and fan-out.
//!
//! Every run gets a bounded in-memory ring buffer (oldest lines drop first),
//! an unbounded append-only log file, and any number of subscribers. Each
//! subscriber owns its own unbounded channel, so a slow reader never causes
//! another to miss lines and never blocks the appender.

pub mod markers;
mod writer;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::Result;
use crate::types::{Severity, StreamSource};

use writer::LogWriter;

pub use markers::{parse_progress, parse_severity};

/// Default number of lines kept in memory per run.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// How many cleaned-up run ids are remembered so late subscribers get an
/// ended stream instead of a fresh buffer.
const RETIRED_CAPACITY: usize = 10_000;

/// One captured output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub run_id: String,
    /// Per-run sequence number, starting at 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub source: StreamSource,
    pub level: Severity,
    pub text: String,
}

/// Receiving side of [`OutputBroadcaster::subscribe`].
///
/// `recv` yields `None` once the run is closed (or cleaned up) and every
/// line delivered before that has been read.
#[derive(Debug)]
pub struct LogSubscription {
    run_id: String,
    rx: mpsc::UnboundedReceiver<LogLine>,
}

impl LogSubscription {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn recv(&mut self) -> Option<LogLine> {
        self.rx.recv().await
    }

    /// Non-blocking receive; `None` when nothing is queued right now.
    pub fn try_recv(&mut self) -> Option<LogLine> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Default)]
struct RunBuffer {
    lines: VecDeque<LogLine>,
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
    subscribers: Vec<mpsc::UnboundedSender<LogLine>>,
    closed: bool,
}

impl RunBuffer {
    fn is_idle(&self) -> bool {
        !self.closed && self.lines.is_empty() && self.subscribers.iter().all(|tx| tx.is_closed())
    }
}

#[derive(Debug, Default)]
struct Buffers {
    runs: HashMap<String, RunBuffer>,
    /// Cleaned-up ids, oldest first, mirrored in `retired_set`.
    retired: VecDeque<String>,
    retired_set: HashSet<String>,
}

impl Buffers {
    fn retire(&mut self, run_id: &str) {
        if !self.retired_set.insert(run_id.to_string()) {
            return;
        }
        self.retired.push_back(run_id.to_string());
        while self.retired.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.retired.pop_front() {
                self.retired_set.remove(&oldest);
            }
        }
    }
}

#[derive(Debug)]
pub struct OutputBroadcaster {
    capacity: usize,
    state: Mutex<Buffers>,
    writer: Option<LogWriter>,
}

impl OutputBroadcaster {
    /// In-memory only; nothing is written to disk.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(Buffers::default()),
            writer: None,
        }
    }

    /// Also persist every line to `<log_dir>/<run_id>.log`.
    pub fn with_log_dir(capacity: usize, log_dir: impl Into<PathBuf>) -> Result<Self> {
        let writer = LogWriter::spawn(log_dir)?;
        Ok(Self {
            writer: Some(writer),
            ..Self::new(capacity)
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.writer.as_ref().map(|w| w.dir())
    }

    /// Path of a run's log file, if file logging is enabled.
    pub fn log_path(&self, run_id: &str) -> Option<PathBuf> {
        self.log_dir().map(|dir| writer::log_file_path(dir, run_id))
    }

    /// Record a line and deliver it to every live subscriber.
    pub fn append_line(&self, run_id: &str, text: impl Into<String>, source: StreamSource) -> LogLine {
        let text = text.into();
        let level = parse_severity(&text);

        let mut state = self.state.lock();
        let buffer = state.runs.entry(run_id.to_string()).or_default();

        // Keep timestamps non-decreasing within a run so `since` filters
        // select a contiguous suffix.
        let now = Utc::now();
        let timestamp = match buffer.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };

        let line = LogLine {
            run_id: run_id.to_string(),
            seq: buffer.next_seq,
            timestamp,
            source,
            level,
            text,
        };
        buffer.next_seq += 1;
        buffer.last_timestamp = Some(timestamp);

        buffer.lines.push_back(line.clone());
        while buffer.lines.len() > self.capacity {
            buffer.lines.pop_front();
        }

        buffer.subscribers.retain(|tx| tx.send(line.clone()).is_ok());

        // Sent under the lock so the file sees lines in sequence order.
        if let Some(writer) = &self.writer {
            writer.write(line.clone());
        }

        line
    }

    /// Live lines appended from now on.
    pub fn subscribe(&self, run_id: &str) -> LogSubscription {
        self.register(run_id, false)
    }

    /// Every buffered line, then live lines, with no gap or duplicate.
    pub fn subscribe_with_replay(&self, run_id: &str) -> LogSubscription {
        self.register(run_id, true)
    }

    fn register(&self, run_id: &str, replay: bool) -> LogSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = LogSubscription {
            run_id: run_id.to_string(),
            rx,
        };
        let mut state = self.state.lock();
        // Nothing more will ever arrive for a cleaned-up run, and recreating
        // its buffer here would leak it.
        if state.retired_set.contains(run_id) {
            return subscription;
        }
        let buffer = state.runs.entry(run_id.to_string()).or_default();

        if replay {
            for line in &buffer.lines {
                let _ = tx.send(line.clone());
            }
        }
        // A closed run has no future lines; dropping `tx` ends the stream
        // after the replayed ones.
        if !buffer.closed {
            buffer.subscribers.push(tx);
        }
        subscription
    }

    /// Buffered lines with `timestamp >= since`, limited to the last `tail`.
    pub fn get_snapshot(
        &self,
        run_id: &str,
        tail: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<LogLine> {
        let state = self.state.lock();
        let Some(buffer) = state.runs.get(run_id) else {
            return Vec::new();
        };

        let selected: Vec<&LogLine> = buffer
            .lines
            .iter()
            .filter(|l| since.is_none_or(|s| l.timestamp >= s))
            .collect();
        let skip = match tail {
            Some(n) => selected.len().saturating_sub(n),
            None => 0,
        };
        selected.into_iter().skip(skip).cloned().collect()
    }

    /// End the run's live stream. The buffer stays for snapshots.
    pub fn close_run(&self, run_id: &str) {
        let mut state = self.state.lock();
        let dropped = if state.retired_set.contains(run_id) {
            0
        } else {
            let buffer = state.runs.entry(run_id.to_string()).or_default();
            buffer.closed = true;
            let dropped = buffer.subscribers.len();
            buffer.subscribers.clear();
            dropped
        };
        drop(state);

        if let Some(writer) = &self.writer {
            writer.close(run_id);
        }
        debug!(run_id = %run_id, subscribers = dropped, "closed run output");
    }

    /// Release the run's buffer; subscribers see the end of their stream.
    /// Later subscriptions to the id end immediately.
    pub fn cleanup_run(&self, run_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state.retire(run_id);
            state.runs.remove(run_id).is_some()
        };
        if let Some(writer) = &self.writer {
            writer.close(run_id);
        }
        removed
    }

    /// True once the run is closed or cleaned up.
    pub fn is_closed(&self, run_id: &str) -> bool {
        let state = self.state.lock();
        state.retired_set.contains(run_id) || state.runs.get(run_id).is_some_and(|b| b.closed)
    }

    pub fn buffered_len(&self, run_id: &str) -> usize {
        self.state.lock().runs.get(run_id).map_or(0, |b| b.lines.len())
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.state
            .lock()
            .runs
            .get(run_id)
            .map_or(0, |b| b.subscribers.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Ids of every run with a live buffer.
    pub fn run_ids(&self) -> Vec<String> {
        self.state.lock().runs.keys().cloned().collect()
    }

    /// Drop open buffers that hold no lines and whose subscribers have all
    /// gone away, e.g. subscriptions to ids that never ran. Returns how
    /// many were dropped.
    pub fn prune_idle(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.runs.len();
        state.runs.retain(|_, buffer| !buffer.is_idle());
        before - state.runs.len()
    }

    /// Wait until every line appended so far is on disk.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
