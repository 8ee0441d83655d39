use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::context::ExecContext;
use crate::cron::{CronSchedule, EntryId};
use crate::executor::{ExecutionError, JobExecutor, NO_EXIT_CODE};
use crate::history::{ExecutionHistory, HistoryStats, Trigger};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a trigger.
    Idle,
    /// An execution is in flight.
    Executing,
    /// Triggers are rejected until resumed.
    Paused,
}

impl JobState {
    /// Lowercase name used in status snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Executing => "executing",
            JobState::Paused => "paused",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State conflicts and execution failures reported by a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Trigger rejected because the job is paused.
    #[error("job {0:?} is paused")]
    Paused(String),
    /// Trigger rejected because an execution is in flight (overlap policy: skip).
    #[error("job {0:?} is already executing")]
    AlreadyExecuting(String),
    /// Pause rejected while executing.
    #[error("cannot pause job {0:?} while it is executing")]
    PauseWhileExecuting(String),
    /// Resume called on a job that is not paused.
    #[error("job {0:?} is not paused")]
    NotPaused(String),
    /// The executor reported a failure.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl JobError {
    /// Exit code to report: -1 unless the process exited with a status.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobError::Execution(e) => e.exit_code(),
            _ => NO_EXIT_CODE,
        }
    }
}

/// Per-job knobs applied at registration.
#[derive(Clone, Default)]
pub struct JobOptions {
    /// Deadline applied to each execution; `None` is unbounded.
    pub timeout: Option<Duration>,
    /// Recorded for reporting only; executions are always serialized.
    pub max_concurrent: usize,
    /// Overrides the scheduler's default executor.
    pub executor: Option<Arc<dyn JobExecutor>>,
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("timeout", &self.timeout)
            .field("max_concurrent", &self.max_concurrent)
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

/// Serializable point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job name.
    pub name: String,
    /// Cron expression.
    pub schedule: String,
    /// IANA timezone name.
    pub timezone: String,
    /// Current state.
    pub state: JobState,
    /// Start of the most recent execution.
    pub last_run: Option<DateTime<Utc>>,
    /// Next scheduled trigger.
    pub next_run: Option<DateTime<Utc>>,
    /// Id of the in-flight execution.
    pub current_execution_id: Option<i64>,
    /// History aggregates.
    pub stats: HistoryStats,
}

#[derive(Debug)]
struct Runtime {
    state: JobState,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    current_execution: Option<i64>,
    entry: Option<EntryId>,
}

/// A named job with a cron schedule, state machine and execution history.
///
/// Two locks guard a job: `runtime` protects state and timestamps and is only
/// held briefly, `exec_lock` is held for the whole run body. Status reads
/// therefore never wait behind a running execution, while two executions of
/// the same job can never overlap.
pub struct ScheduledJob {
    name: String,
    schedule: CronSchedule,
    timezone: String,
    timeout: Option<Duration>,
    max_concurrent: usize,
    executor: Arc<dyn JobExecutor>,
    history: Arc<ExecutionHistory>,
    runtime: Arc<Mutex<Runtime>>,
    exec_lock: Arc<tokio::sync::Mutex<()>>,
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.name)
            .field("schedule", &self.schedule.expression())
            .field("state", &self.state())
            .finish()
    }
}

// An accepted execution. Dropping it before `finish` (the run future was
// abandoned) closes the history entry as cancelled and returns the job to Idle.
struct Started {
    id: i64,
    runtime: Arc<Mutex<Runtime>>,
    history: Arc<ExecutionHistory>,
    finished: bool,
    _guard: OwnedMutexGuard<()>,
}

impl Started {
    fn finish(mut self, exit_code: i32, success: bool, error: &str) {
        self.close(exit_code, success, error);
        self.finished = true;
    }

    fn close(&self, exit_code: i32, success: bool, error: &str) {
        {
            let mut rt = self.runtime.lock();
            rt.state = JobState::Idle;
            rt.current_execution = None;
        }
        self.history.end_execution(self.id, exit_code, success, error);
    }
}

impl Drop for Started {
    fn drop(&mut self) {
        if !self.finished {
            let error = ExecutionError::Cancelled.to_string();
            self.close(NO_EXIT_CODE, false, &error);
            warn!(execution = self.id, "execution abandoned before completion");
        }
    }
}

impl ScheduledJob {
    /// Create an idle job.
    pub fn new(
        name: impl Into<String>,
        schedule: CronSchedule,
        timezone: impl Into<String>,
        executor: Arc<dyn JobExecutor>,
        history_size: usize,
        timeout: Option<Duration>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            name: name.into(),
            schedule,
            timezone: timezone.into(),
            timeout: timeout.filter(|t| !t.is_zero()),
            max_concurrent: max_concurrent.max(1),
            executor,
            history: Arc::new(ExecutionHistory::new(history_size)),
            runtime: Arc::new(Mutex::new(Runtime {
                state: JobState::Idle,
                last_run: None,
                next_run: None,
                current_execution: None,
                entry: None,
            })),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Unique job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parsed schedule.
    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    /// Timezone as registered.
    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    /// Per-execution timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Configured concurrency; informational only.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Execution history of this job.
    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.runtime.lock().state
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        self.state() == JobState::Paused
    }

    /// True while an execution is in flight.
    pub fn is_executing(&self) -> bool {
        self.state() == JobState::Executing
    }

    /// True when a trigger would currently be accepted.
    pub fn can_execute(&self) -> bool {
        self.state() == JobState::Idle
    }

    /// Start time of the most recent execution.
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.runtime.lock().last_run
    }

    /// Next scheduled trigger as last reported by the cron engine.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.runtime.lock().next_run
    }

    pub(crate) fn set_next_run(&self, next: Option<DateTime<Utc>>) {
        self.runtime.lock().next_run = next;
    }

    pub(crate) fn entry(&self) -> Option<EntryId> {
        self.runtime.lock().entry
    }

    pub(crate) fn set_entry(&self, entry: Option<EntryId>) {
        self.runtime.lock().entry = entry;
    }

    /// Stop accepting triggers. Fails while executing; no-op if already paused.
    pub fn pause(&self) -> Result<(), JobError> {
        let mut rt = self.runtime.lock();
        match rt.state {
            JobState::Executing => Err(JobError::PauseWhileExecuting(self.name.clone())),
            JobState::Paused => Ok(()),
            JobState::Idle => {
                rt.state = JobState::Paused;
                info!(job = %self.name, "job paused");
                Ok(())
            }
        }
    }

    /// Accept triggers again. Fails unless paused.
    pub fn resume(&self) -> Result<(), JobError> {
        let mut rt = self.runtime.lock();
        if rt.state != JobState::Paused {
            return Err(JobError::NotPaused(self.name.clone()));
        }
        rt.state = JobState::Idle;
        info!(job = %self.name, "job resumed");
        Ok(())
    }

    /// Entry point for the cron engine.
    pub async fn run(&self) {
        let started = match self.begin(Trigger::Schedule) {
            Ok(started) => started,
            Err(e) => {
                debug!(job = %self.name, "scheduled run skipped: {e}");
                return;
            }
        };
        if let Err(e) = self.execute(started, &ExecContext::background()).await {
            warn!(job = %self.name, exit_code = e.exit_code(), "scheduled run failed: {e}");
        }
    }

    /// Start an execution in the background and return without waiting.
    ///
    /// Rejected immediately if the job is paused or already executing.
    pub fn trigger(self: &Arc<Self>, ctx: &ExecContext) -> Result<(), JobError> {
        let started = self.begin(Trigger::Manual)?;
        let job = Arc::clone(self);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = job.execute(started, &ctx).await {
                warn!(job = %job.name, exit_code = e.exit_code(), "triggered run failed: {e}");
            }
        });
        Ok(())
    }

    /// Run an execution and wait for it to finish.
    pub async fn trigger_sync(&self, ctx: &ExecContext) -> Result<i32, JobError> {
        let started = self.begin(Trigger::Api)?;
        self.execute(started, ctx).await.map_err(JobError::from)
    }

    /// Point-in-time snapshot.
    pub fn status(&self) -> JobStatus {
        let (state, last_run, next_run, current_execution_id) = {
            let rt = self.runtime.lock();
            (rt.state, rt.last_run, rt.next_run, rt.current_execution)
        };
        JobStatus {
            name: self.name.clone(),
            schedule: self.schedule.expression().to_string(),
            timezone: self.timezone.clone(),
            state,
            last_run,
            next_run,
            current_execution_id,
            stats: self.history.stats(),
        }
    }

    // Gate: execution lock first, then the state check under the state lock.
    fn begin(&self, triggered: Trigger) -> Result<Started, JobError> {
        let guard = self
            .exec_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| JobError::AlreadyExecuting(self.name.clone()))?;

        let mut rt = self.runtime.lock();
        match rt.state {
            JobState::Paused => return Err(JobError::Paused(self.name.clone())),
            JobState::Executing => return Err(JobError::AlreadyExecuting(self.name.clone())),
            JobState::Idle => {}
        }
        let id = self.history.start_execution(triggered);
        rt.state = JobState::Executing;
        rt.last_run = Some(Utc::now());
        rt.current_execution = Some(id);
        info!(job = %self.name, execution = id, %triggered, "job started");
        Ok(Started {
            id,
            runtime: Arc::clone(&self.runtime),
            history: Arc::clone(&self.history),
            finished: false,
            _guard: guard,
        })
    }

    async fn execute(&self, started: Started, ctx: &ExecContext) -> Result<i32, ExecutionError> {
        let ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        let result = self.executor.execute(&ctx, &self.name).await;

        let (exit_code, success, error) = match &result {
            Ok(code) => (*code, *code == 0, String::new()),
            Err(e) => (e.exit_code(), false, e.to_string()),
        };
        let id = started.id;
        started.finish(exit_code, success, &error);
        info!(job = %self.name, execution = id, exit_code, success, "job finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FnExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn job_with(executor: FnExecutor, timeout: Option<Duration>) -> Arc<ScheduledJob> {
        let schedule = CronSchedule::parse("*/5 * * * *", "UTC").unwrap();
        Arc::new(ScheduledJob::new("test", schedule, "UTC", Arc::new(executor), 10, timeout, 1))
    }

    fn counting(calls: Arc<AtomicUsize>, code: i32) -> FnExecutor {
        FnExecutor::new(move |_ctx, _job| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(code)
            }
        })
    }

    #[tokio::test]
    async fn trigger_sync_records_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let job = job_with(counting(calls.clone(), 0), None);

        let code = job.trigger_sync(&ExecContext::background()).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(job.state(), JobState::Idle);
        assert!(job.last_run().is_some());

        let entry = job.history().get_last().unwrap();
        assert!(entry.success);
        assert_eq!(entry.triggered, Trigger::Api);
        assert!(!entry.is_running());
    }

    #[tokio::test]
    async fn non_zero_ok_is_unsuccessful() {
        let job = job_with(counting(Arc::new(AtomicUsize::new(0)), 3), None);
        assert_eq!(job.trigger_sync(&ExecContext::background()).await.unwrap(), 3);
        let entry = job.history().get_last().unwrap();
        assert!(!entry.success);
        assert_eq!(entry.exit_code, 3);
        assert!(entry.error.is_empty());
    }

    #[tokio::test]
    async fn executor_error_is_recorded_verbatim() {
        let job = job_with(
            FnExecutor::new(|_ctx, _job| async { Err(ExecutionError::NonZeroExit { code: 42 }) }),
            None,
        );
        let err = job.trigger_sync(&ExecContext::background()).await.unwrap_err();
        assert_eq!(err.exit_code(), 42);
        let entry = job.history().get_last().unwrap();
        assert_eq!(entry.exit_code, 42);
        assert!(!entry.success);
        assert_eq!(entry.error, "process exited with code 42");
    }

    #[tokio::test]
    async fn pause_blocks_triggers_until_resume() {
        let calls = Arc::new(AtomicUsize::new(0));
        let job = job_with(counting(calls.clone(), 0), None);
        let ctx = ExecContext::background();

        job.pause().unwrap();
        job.pause().unwrap();
        assert!(job.is_paused());
        assert!(matches!(job.trigger(&ctx), Err(JobError::Paused(_))));
        let err = job.trigger_sync(&ctx).await.unwrap_err();
        assert_eq!(err.exit_code(), NO_EXIT_CODE);
        job.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(job.history().is_empty());

        job.resume().unwrap();
        assert!(!job.is_paused());
        assert!(matches!(job.resume(), Err(JobError::NotPaused(_))));
        job.trigger_sync(&ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_triggers_are_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let (c, r) = (calls.clone(), release.clone());
        let job = job_with(
            FnExecutor::new(move |_ctx, _job| {
                let (c, r) = (c.clone(), r.clone());
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    r.notified().await;
                    Ok(0)
                }
            }),
            None,
        );
        let ctx = ExecContext::background();

        let results: Vec<_> = (0..16).map(|_| job.trigger(&ctx)).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, JobError::AlreadyExecuting(_))));

        assert!(job.is_executing());
        assert!(!job.is_paused());
        assert!(matches!(job.pause(), Err(JobError::PauseWhileExecuting(_))));
        assert!(job.status().current_execution_id.is_some());

        release.notify_one();
        for _ in 0..100 {
            if job.can_execute() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(job.can_execute());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(job.history().get_last().unwrap().triggered, Trigger::Manual);
    }

    #[tokio::test]
    async fn timeout_cancels_blocking_executor() {
        let job = job_with(
            FnExecutor::new(|ctx: ExecContext, _job| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(0),
                    _ = ctx.done() => Err(ctx.err().map(ExecutionError::from).unwrap_or(ExecutionError::Cancelled)),
                }
            }),
            Some(Duration::from_millis(100)),
        );

        let started = std::time::Instant::now();
        let err = job.trigger_sync(&ExecContext::background()).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(err.exit_code(), NO_EXIT_CODE);
        assert!(matches!(err, JobError::Execution(ExecutionError::TimedOut)));
        assert_eq!(job.state(), JobState::Idle);
    }

    #[tokio::test]
    async fn abandoned_trigger_sync_returns_job_to_idle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let job = job_with(
            FnExecutor::new(move |_ctx, _job| {
                let first = c.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(0)
                }
            }),
            None,
        );
        let ctx = ExecContext::background();

        let abandoned = tokio::time::timeout(Duration::from_millis(50), job.trigger_sync(&ctx)).await;
        assert!(abandoned.is_err());
        assert_eq!(job.state(), JobState::Idle);
        assert!(job.status().current_execution_id.is_none());

        let entry = job.history().get_last().unwrap();
        assert!(!entry.is_running());
        assert!(!entry.success);
        assert_eq!(entry.exit_code, NO_EXIT_CODE);
        assert_eq!(entry.error, ExecutionError::Cancelled.to_string());

        job.pause().unwrap();
        job.resume().unwrap();
        assert_eq!(job.trigger_sync(&ctx).await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(job.history().len(), 2);
    }

    #[tokio::test]
    async fn status_snapshot_serializes() {
        let job = job_with(counting(Arc::new(AtomicUsize::new(0)), 0), None);
        job.run().await;
        let status = job.status();
        assert_eq!(status.state, JobState::Idle);
        assert_eq!(status.stats.total_executions, 1);
        assert!(status.current_execution_id.is_none());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["schedule"], "*/5 * * * *");
    }
}
