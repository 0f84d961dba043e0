//! Progress Log
//!
//! Every bootstrap step writes a human-readable status line. Lines always go to
//! `tracing` (target `nodelaunch::progress`) and additionally to an optional
//! sink owned by the caller, e.g. a per-node log file or an in-memory buffer.

use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

/// Append-only destination for progress lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Keeps progress lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all lines written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Number of lines that contain `needle`
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines
            .lock()
            .iter()
            .filter(|l| l.contains(needle))
            .count()
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Writes timestamped lines to any writer (file, stderr).
pub struct WriterSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> LogSink for WriterSink<W> {
    fn write_line(&self, line: &str) {
        let mut writer = self.writer.lock();
        // A broken log file must never abort a bootstrap
        let _ = writeln!(
            writer,
            "{} {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            line
        );
        let _ = writer.flush();
    }
}

/// Cloneable handle used by every bootstrap component.
#[derive(Clone)]
pub struct ProgressLog {
    launch_id: Arc<str>,
    sink: Option<Arc<dyn LogSink>>,
}

impl ProgressLog {
    /// Log that only reaches `tracing`
    pub fn tracing_only(launch_id: impl Into<Arc<str>>) -> Self {
        Self {
            launch_id: launch_id.into(),
            sink: None,
        }
    }

    pub fn with_sink(launch_id: impl Into<Arc<str>>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            launch_id: launch_id.into(),
            sink: Some(sink),
        }
    }

    pub fn launch_id(&self) -> &str {
        &self.launch_id
    }

    /// Write one status line.
    pub fn line(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        info!(target: "nodelaunch::progress", launch = %self.launch_id, "{}", line);
        if let Some(sink) = &self.sink {
            sink.write_line(line);
        }
    }
}

impl std::fmt::Debug for ProgressLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressLog")
            .field("launch_id", &self.launch_id)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

/// Splits streamed output into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    /// Append a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline_pos);
            lines.push(line);
        }
        lines
    }

    /// Remaining partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}
