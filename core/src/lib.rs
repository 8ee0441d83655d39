#![deny(missing_docs)]
//! overseer_core: job scheduling core (state machine, history, cron engine,
//! process executor) plus config and logging helpers.

/// Configuration helpers (AppId, dirs, load_or_init, job tables).
pub mod cfg;
/// Tracing/log initialization helpers.
pub mod logx;
/// Cancellation scope passed to executors.
pub mod context;
/// Bounded per-job execution history.
pub mod history;
/// Executor contract and the in-process variant.
pub mod executor;
/// Cron expressions and the dispatch engine.
pub mod cron;
/// Per-job state machine.
pub mod job;
/// Output sinks for captured process logs.
pub mod logsink;
/// OS process executor.
pub mod process;
/// Job registry.
pub mod scheduler;

pub use context::{ContextError, ExecContext};
pub use executor::{ExecutionError, FnExecutor, JobExecutor};
pub use history::{ExecutionEntry, ExecutionHistory, HistoryStats, Trigger};
pub use job::{JobError, JobOptions, JobState, JobStatus, ScheduledJob};
pub use process::{ProcessConfig, ProcessExecutor};
pub use scheduler::{Scheduler, SchedulerError, SchedulerStats};
