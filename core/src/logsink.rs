use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::process::ProcessConfig;

/// Entries kept per process when the config does not say otherwise.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

const FLUSH_BATCH: usize = 64;
const REDACTED: &str = "[REDACTED]";

/// Where a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    /// Child standard output.
    Stdout,
    /// Child standard error.
    Stderr,
    /// Lifecycle marker emitted by the executor.
    Event,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
            Stream::Event => "event",
        })
    }
}

/// Severity attached to a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Regular output and lifecycle events.
    Info,
    /// Output written to stderr.
    Error,
}

/// One structured log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Owning process name.
    pub process: String,
    /// Source stream.
    pub stream: Stream,
    /// Line content, redacted.
    pub message: String,
    /// Severity.
    pub level: LogLevel,
}

/// Output sink for one process.
pub trait LogSink: Send + Sync {
    /// Record a line of child output.
    fn write(&self, stream: Stream, line: &str);
    /// Record a lifecycle event.
    fn event(&self, message: &str);
    /// Make buffered output visible to [`recent`](Self::recent).
    fn flush(&self);
    /// Up to `limit` most recent entries (0 = all), any order.
    fn recent(&self, limit: usize) -> Vec<LogEntry>;
}

/// Builds a sink for each registered process.
pub trait SinkFactory: Send + Sync {
    /// Create the sink for `process`; fails on invalid sink settings.
    fn create(&self, process: &str, config: &ProcessConfig) -> anyhow::Result<Arc<dyn LogSink>>;
}

/// Bounded in-memory sink.
///
/// Lines collect in a pending buffer and move into the retained ring on
/// `flush` or once the buffer holds a full batch.
pub struct MemorySink {
    process: String,
    capacity: usize,
    redact: Vec<Regex>,
    pending: Mutex<Vec<LogEntry>>,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl MemorySink {
    /// Sink for `process` keeping at most `capacity` entries.
    pub fn new(process: impl Into<String>, capacity: usize, redact: Vec<Regex>) -> Self {
        let capacity = capacity.max(1);
        Self {
            process: process.into(),
            capacity,
            redact,
            pending: Mutex::new(Vec::new()),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY))),
        }
    }

    fn push(&self, stream: Stream, line: &str) {
        let mut message = line.trim_end_matches(['\r', '\n']).to_string();
        for re in &self.redact {
            message = re.replace_all(&message, REDACTED).into_owned();
        }
        let level = match stream {
            Stream::Stderr => LogLevel::Error,
            Stream::Stdout | Stream::Event => LogLevel::Info,
        };
        let entry = LogEntry { timestamp: Utc::now(), process: self.process.clone(), stream, message, level };

        let full = {
            let mut pending = self.pending.lock();
            pending.push(entry);
            pending.len() >= FLUSH_BATCH
        };
        if full {
            self.flush();
        }
    }
}

impl LogSink for MemorySink {
    fn write(&self, stream: Stream, line: &str) {
        self.push(stream, line);
    }

    fn event(&self, message: &str) {
        self.push(Stream::Event, message);
    }

    fn flush(&self) {
        let drained = std::mem::take(&mut *self.pending.lock());
        let mut entries = self.entries.lock();
        for entry in drained {
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let take = if limit == 0 { entries.len() } else { limit };
        entries.iter().rev().take(take).cloned().collect()
    }
}

/// Factory producing a [`MemorySink`] per process.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySinkFactory;

impl SinkFactory for MemorySinkFactory {
    fn create(&self, process: &str, config: &ProcessConfig) -> anyhow::Result<Arc<dyn LogSink>> {
        let redact = config
            .redact
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("compile redact pattern {p:?}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let capacity = config.log_capacity.unwrap_or(DEFAULT_LOG_CAPACITY);
        Ok(Arc::new(MemorySink::new(process, capacity, redact)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_lines_appear_after_flush() {
        let sink = MemorySink::new("web", 10, Vec::new());
        sink.write(Stream::Stdout, "hello\n");
        assert!(sink.recent(0).is_empty());
        sink.flush();
        let got = sink.recent(0);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message, "hello");
        assert_eq!(got[0].process, "web");
    }

    #[test]
    fn ring_keeps_newest() {
        let sink = MemorySink::new("web", 3, Vec::new());
        for i in 0..5 {
            sink.write(Stream::Stderr, &format!("line {i}"));
        }
        sink.flush();
        let messages: Vec<String> = sink.recent(2).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 4", "line 3"]);
        assert_eq!(sink.recent(0).len(), 3);
        assert_eq!(sink.recent(0)[0].level, LogLevel::Error);
    }

    #[test]
    fn full_batch_flushes_itself() {
        let sink = MemorySink::new("web", 1000, Vec::new());
        for i in 0..FLUSH_BATCH {
            sink.write(Stream::Stdout, &i.to_string());
        }
        assert_eq!(sink.recent(0).len(), FLUSH_BATCH);
    }

    #[test]
    fn factory_redacts_and_rejects_bad_patterns() {
        let mut config = ProcessConfig::new(["echo"]);
        config.redact = vec![r"token=\S+".into()];
        let sink = MemorySinkFactory.create("api", &config).unwrap();
        sink.event("boot token=abc123 ok");
        sink.flush();
        assert_eq!(sink.recent(1)[0].message, "boot [REDACTED] ok");
        assert_eq!(sink.recent(1)[0].stream, Stream::Event);

        config.redact = vec!["(unclosed".into()];
        assert!(MemorySinkFactory.create("api", &config).is_err());
    }
}
