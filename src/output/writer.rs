// src/output/writer.rs

//! Dedicated thread appending rendered log lines to per-run files.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::errors::Result;

use super::LogLine;

#[derive(Debug)]
enum WriterCommand {
    Line(LogLine),
    Close(String),
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer thread. Dropping it lets the thread drain its queue
/// and exit.
#[derive(Debug)]
pub(crate) struct LogWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
    dir: PathBuf,
}

impl LogWriter {
    pub(crate) fn spawn(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let thread_dir = dir.clone();
        std::thread::Builder::new()
            .name("modrun-log-writer".to_string())
            .spawn(move || writer_loop(thread_dir, rx))?;

        Ok(Self { tx, dir })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn write(&self, line: LogLine) {
        if self.tx.send(WriterCommand::Line(line)).is_err() {
            warn!("log writer thread is gone; dropping line");
        }
    }

    pub(crate) fn close(&self, run_id: &str) {
        let _ = self.tx.send(WriterCommand::Close(run_id.to_string()));
    }

    /// Resolves once everything sent before this call is on disk.
    pub(crate) async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

pub(crate) fn log_file_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{run_id}.log"))
}

pub(crate) fn render(line: &LogLine) -> String {
    format!(
        "{} [{}] [{}] {}",
        line.timestamp.to_rfc3339(),
        line.source,
        line.level,
        line.text
    )
}

fn writer_loop(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    let mut files: HashMap<String, BufWriter<File>> = HashMap::new();

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            WriterCommand::Line(line) => append(&dir, &mut files, &line),
            WriterCommand::Close(run_id) => {
                if let Some(mut file) = files.remove(&run_id) {
                    if let Err(e) = file.flush() {
                        warn!(run_id = %run_id, error = %e, "failed to flush run log");
                    }
                }
            }
            WriterCommand::Flush(ack) => {
                flush_all(&mut files);
                let _ = ack.send(());
            }
        }

        if rx.is_empty() {
            flush_all(&mut files);
        }
    }

    flush_all(&mut files);
    debug!("log writer thread exiting");
}

fn append(dir: &Path, files: &mut HashMap<String, BufWriter<File>>, line: &LogLine) {
    if !files.contains_key(&line.run_id) {
        let path = log_file_path(dir, &line.run_id);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                files.insert(line.run_id.clone(), BufWriter::new(file));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open run log");
                return;
            }
        }
    }

    if let Some(file) = files.get_mut(&line.run_id) {
        if let Err(e) = writeln!(file, "{}", render(line)) {
            warn!(run_id = %line.run_id, error = %e, "failed to write run log");
        }
    }
}

fn flush_all(files: &mut HashMap<String, BufWriter<File>>) {
    for (run_id, file) in files.iter_mut() {
        if let Err(e) = file.flush() {
            warn!(run_id = %run_id, error = %e, "failed to flush run log");
        }
    }
}
