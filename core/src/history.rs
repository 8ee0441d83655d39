use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default number of entries retained per job.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fired by the cron engine.
    Schedule,
    /// Fire-and-forget manual trigger.
    Manual,
    /// Synchronous trigger from an API caller.
    Api,
}

impl Trigger {
    /// Provenance tag as recorded in history.
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
            Trigger::Api => "api",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded attempt to run a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEntry {
    /// Unique within the owning history, never reused.
    pub id: i64,
    /// When the execution started.
    pub start_time: DateTime<Utc>,
    /// When it finished; `None` while still running.
    pub end_time: Option<DateTime<Utc>>,
    /// Exit code reported by the executor.
    pub exit_code: i32,
    /// True iff the executor returned no error and exit code 0.
    pub success: bool,
    /// Error text, empty if none.
    pub error: String,
    /// Provenance tag.
    pub triggered: Trigger,
}

impl ExecutionEntry {
    /// True until the entry has been closed.
    pub fn is_running(&self) -> bool {
        self.end_time.is_none()
    }

    /// Elapsed time so far if running, total run time otherwise.
    pub fn duration(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }
}

/// Aggregate statistics derived from a history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    /// Entries currently retained.
    pub total_executions: usize,
    /// Completed successfully.
    pub success_count: usize,
    /// Completed unsuccessfully.
    pub failure_count: usize,
    /// Still running.
    pub running_count: usize,
    /// Percentage of completed entries that succeeded.
    pub success_rate: f64,
    /// Mean duration over completed entries.
    pub average_duration: Duration,
    /// Start time of the newest entry.
    pub last_execution_time: Option<DateTime<Utc>>,
    /// End time of the newest successful entry.
    pub last_success_time: Option<DateTime<Utc>>,
    /// End time of the newest failed entry.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Completions reported for entries that were already evicted.
    pub dropped_completions: u64,
}

struct Ring {
    entries: VecDeque<ExecutionEntry>,
    next_id: i64,
    dropped_completions: u64,
}

/// Bounded, thread-safe execution log for a single job.
///
/// Oldest entries are evicted first once `max_size` is reached. Ids keep
/// increasing for the lifetime of the history.
pub struct ExecutionHistory {
    max_size: usize,
    inner: RwLock<Ring>,
}

impl fmt::Debug for ExecutionHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHistory")
            .field("max_size", &self.max_size)
            .field("len", &self.len())
            .finish()
    }
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl ExecutionHistory {
    /// A zero `max_size` is bumped to 1.
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            inner: RwLock::new(Ring {
                entries: VecDeque::with_capacity(max_size),
                next_id: 1,
                dropped_completions: 0,
            }),
        }
    }

    /// Open a new running entry and return its id.
    pub fn start_execution(&self, triggered: Trigger) -> i64 {
        let mut ring = self.inner.write();
        let id = ring.next_id;
        ring.next_id += 1;
        if ring.entries.len() >= self.max_size {
            ring.entries.pop_front();
        }
        ring.entries.push_back(ExecutionEntry {
            id,
            start_time: Utc::now(),
            end_time: None,
            exit_code: 0,
            success: false,
            error: String::new(),
            triggered,
        });
        id
    }

    /// Close entry `id`. Ignored (and counted) if the entry was evicted.
    pub fn end_execution(&self, id: i64, exit_code: i32, success: bool, error: &str) {
        let mut ring = self.inner.write();
        match ring.entries.iter_mut().rev().find(|e| e.id == id) {
            Some(entry) => {
                entry.end_time = Some(Utc::now());
                entry.exit_code = exit_code;
                entry.success = success;
                entry.error = error.to_string();
            }
            None => ring.dropped_completions += 1,
        }
    }

    /// All retained entries, newest first.
    pub fn get_all(&self) -> Vec<ExecutionEntry> {
        self.inner.read().entries.iter().rev().cloned().collect()
    }

    /// Up to `n` entries, newest first. `n == 0` returns everything.
    pub fn get_recent(&self, n: usize) -> Vec<ExecutionEntry> {
        let ring = self.inner.read();
        let take = if n == 0 { ring.entries.len() } else { n };
        ring.entries.iter().rev().take(take).cloned().collect()
    }

    /// Look up a retained entry.
    pub fn get_by_id(&self, id: i64) -> Option<ExecutionEntry> {
        self.inner.read().entries.iter().rev().find(|e| e.id == id).cloned()
    }

    /// Newest entry.
    pub fn get_last(&self) -> Option<ExecutionEntry> {
        self.inner.read().entries.back().cloned()
    }

    /// Entries retained.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True before the first execution.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum entries retained.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Success percentage over completed entries; 0 when none completed.
    pub fn success_rate(&self) -> f64 {
        let ring = self.inner.read();
        let (completed, succeeded) = ring
            .entries
            .iter()
            .filter(|e| !e.is_running())
            .fold((0usize, 0usize), |(c, s), e| (c + 1, s + e.success as usize));
        if completed == 0 {
            0.0
        } else {
            succeeded as f64 / completed as f64 * 100.0
        }
    }

    /// Snapshot of aggregate statistics.
    pub fn stats(&self) -> HistoryStats {
        let ring = self.inner.read();
        let mut stats = HistoryStats {
            total_executions: ring.entries.len(),
            dropped_completions: ring.dropped_completions,
            last_execution_time: ring.entries.back().map(|e| e.start_time),
            ..HistoryStats::default()
        };

        let mut total = Duration::ZERO;
        for entry in &ring.entries {
            let Some(end) = entry.end_time else {
                stats.running_count += 1;
                continue;
            };
            total += entry.duration();
            if entry.success {
                stats.success_count += 1;
                stats.last_success_time = stats.last_success_time.max(Some(end));
            } else {
                stats.failure_count += 1;
                stats.last_failure_time = stats.last_failure_time.max(Some(end));
            }
        }

        let completed = stats.success_count + stats.failure_count;
        if completed > 0 {
            stats.success_rate = stats.success_count as f64 / completed as f64 * 100.0;
            stats.average_duration = total / completed as u32;
        }
        stats
    }
}
