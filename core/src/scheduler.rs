//! Job registry wired to the cron engine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::ExecContext;
use crate::cron::{CronCallback, CronEngine, CronError, CronSchedule, StopHandle};
use crate::executor::JobExecutor;
use crate::history::{ExecutionEntry, DEFAULT_HISTORY_SIZE};
use crate::job::{JobError, JobOptions, JobState, JobStatus, ScheduledJob};

/// Registry and lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A job with this name already exists.
    #[error("job {0:?} already exists")]
    DuplicateJob(String),
    /// No job with this name.
    #[error("job {0:?} not found")]
    NotFound(String),
    /// The schedule did not parse.
    #[error(transparent)]
    Cron(#[from] CronError),
    /// The job rejected the request or its execution failed.
    #[error(transparent)]
    Job(#[from] JobError),
}

impl SchedulerError {
    /// Exit code to report for a failed trigger.
    pub fn exit_code(&self) -> i32 {
        match self {
            SchedulerError::Job(e) => e.exit_code(),
            _ => crate::executor::NO_EXIT_CODE,
        }
    }
}

/// Live tally of job states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Registered jobs.
    pub total_jobs: usize,
    /// Jobs waiting for a trigger.
    pub idle_jobs: usize,
    /// Jobs with an execution in flight.
    pub executing_jobs: usize,
    /// Paused jobs.
    pub paused_jobs: usize,
    /// Whether dispatch is running.
    pub started: bool,
    /// When dispatch was last started.
    pub start_time: Option<DateTime<Utc>>,
}

/// Owns the cron engine and every registered job.
pub struct Scheduler {
    engine: CronEngine,
    jobs: RwLock<HashMap<String, Arc<ScheduledJob>>>,
    executor: Arc<dyn JobExecutor>,
    history_size: usize,
    start_time: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    /// Scheduler running jobs through `executor` unless a job overrides it.
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        Self::with_history_size(executor, DEFAULT_HISTORY_SIZE)
    }

    /// Like [`new`](Self::new) with a custom per-job history capacity.
    pub fn with_history_size(executor: Arc<dyn JobExecutor>, history_size: usize) -> Self {
        Self {
            engine: CronEngine::new(),
            jobs: RwLock::new(HashMap::new()),
            executor,
            history_size,
            start_time: Mutex::new(None),
        }
    }

    /// History capacity given to new jobs.
    pub fn history_size(&self) -> usize {
        self.history_size
    }

    /// Register a job and hook it into the cron engine.
    pub fn add_job(
        &self,
        name: &str,
        cron_expr: &str,
        timezone: &str,
        options: JobOptions,
    ) -> Result<(), SchedulerError> {
        let schedule = CronSchedule::parse(cron_expr, timezone)?;

        let mut jobs = self.jobs.write();
        if jobs.contains_key(name) {
            return Err(SchedulerError::DuplicateJob(name.to_string()));
        }

        let executor = options.executor.unwrap_or_else(|| self.executor.clone());
        let job = Arc::new(ScheduledJob::new(
            name,
            schedule.clone(),
            timezone,
            executor,
            self.history_size,
            options.timeout,
            options.max_concurrent,
        ));

        let target = Arc::clone(&job);
        let callback: CronCallback = Arc::new(move || {
            let job = Arc::clone(&target);
            Box::pin(async move { job.run().await })
        });
        let entry = self.engine.add(schedule, callback);
        job.set_entry(Some(entry));
        job.set_next_run(self.engine.next(entry));

        info!(job = name, schedule = cron_expr, next_run = ?job.next_run(), "job added");
        jobs.insert(name.to_string(), job);
        Ok(())
    }

    /// Deregister a job. Running executions are left to finish.
    pub fn remove_job(&self, name: &str) -> Result<(), SchedulerError> {
        let job = self
            .jobs
            .write()
            .remove(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        if let Some(entry) = job.entry() {
            self.engine.remove(entry);
        }
        job.set_entry(None);
        info!(job = name, "job removed");
        Ok(())
    }

    /// Look up a job.
    pub fn get_job(&self, name: &str) -> Option<Arc<ScheduledJob>> {
        self.jobs.read().get(name).cloned()
    }

    /// Copy of the registry.
    pub fn get_all_jobs(&self) -> HashMap<String, Arc<ScheduledJob>> {
        self.jobs.read().clone()
    }

    /// Registered names, sorted.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Begin dispatching. No-op if already started.
    pub fn start(&self) {
        let mut start_time = self.start_time.lock();
        if start_time.is_some() {
            return;
        }
        self.engine.start();
        *start_time = Some(Utc::now());
        for job in self.jobs.read().values() {
            self.refresh_next_run(job);
        }
        info!(jobs = self.jobs.read().len(), "scheduler started");
    }

    /// Stop dispatching new triggers.
    ///
    /// The handle resolves once the cron engine has drained; executions that
    /// were already running may still be in flight.
    pub fn stop(&self) -> StopHandle {
        let was_started = self.start_time.lock().take().is_some();
        if was_started {
            info!("scheduler stopping");
        }
        self.engine.stop()
    }

    /// Whether dispatch is running.
    pub fn is_started(&self) -> bool {
        self.start_time.lock().is_some()
    }

    /// Pause a job.
    pub fn pause_job(&self, name: &str) -> Result<(), SchedulerError> {
        Ok(self.require(name)?.pause()?)
    }

    /// Resume a paused job.
    pub fn resume_job(&self, name: &str) -> Result<(), SchedulerError> {
        Ok(self.require(name)?.resume()?)
    }

    /// Start a background execution of a job.
    pub fn trigger_job(&self, name: &str, ctx: &ExecContext) -> Result<(), SchedulerError> {
        Ok(self.require(name)?.trigger(ctx)?)
    }

    /// Run a job and wait for its exit code.
    pub async fn trigger_job_sync(&self, name: &str, ctx: &ExecContext) -> Result<i32, SchedulerError> {
        let job = self.require(name)?;
        Ok(job.trigger_sync(ctx).await?)
    }

    /// Status of one job, with a freshly queried next run.
    pub fn get_job_status(&self, name: &str) -> Result<JobStatus, SchedulerError> {
        let job = self.require(name)?;
        self.refresh_next_run(&job);
        Ok(job.status())
    }

    /// Status of every job, sorted by name.
    pub fn get_all_job_statuses(&self) -> Vec<JobStatus> {
        let jobs: Vec<Arc<ScheduledJob>> = self.jobs.read().values().cloned().collect();
        let mut statuses: Vec<JobStatus> = jobs
            .iter()
            .map(|job| {
                self.refresh_next_run(job);
                job.status()
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Most recent `limit` executions of a job (0 = all), newest first.
    pub fn get_job_history(&self, name: &str, limit: usize) -> Result<Vec<ExecutionEntry>, SchedulerError> {
        Ok(self.require(name)?.history().get_recent(limit))
    }

    /// Tally computed from current job states.
    pub fn stats(&self) -> SchedulerStats {
        let start_time = *self.start_time.lock();
        let jobs = self.jobs.read();
        let mut stats = SchedulerStats {
            total_jobs: jobs.len(),
            idle_jobs: 0,
            executing_jobs: 0,
            paused_jobs: 0,
            started: start_time.is_some(),
            start_time,
        };
        for job in jobs.values() {
            match job.state() {
                JobState::Idle => stats.idle_jobs += 1,
                JobState::Executing => stats.executing_jobs += 1,
                JobState::Paused => stats.paused_jobs += 1,
            }
        }
        stats
    }

    fn require(&self, name: &str) -> Result<Arc<ScheduledJob>, SchedulerError> {
        self.get_job(name).ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    fn refresh_next_run(&self, job: &ScheduledJob) {
        if let Some(entry) = job.entry() {
            job.set_next_run(self.engine.next(entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FnExecutor;

    fn scheduler() -> Scheduler {
        Scheduler::with_history_size(Arc::new(FnExecutor::new(|_ctx, _job| async { Ok(0) })), 5)
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let s = scheduler();
        s.add_job("A", "*/5 * * * *", "UTC", JobOptions::default()).unwrap();
        let err = s.add_job("A", "*/5 * * * *", "UTC", JobOptions::default()).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob(ref n) if n == "A"));
        assert_eq!(s.get_all_jobs().len(), 1);
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let s = scheduler();
        let err = s.add_job("bad", "every minute", "UTC", JobOptions::default()).unwrap_err();
        assert!(matches!(err, SchedulerError::Cron(_)));
        assert!(s.get_job("bad").is_none());
    }

    #[test]
    fn add_seeds_next_run_and_history_size() {
        let s = scheduler();
        s.add_job("A", "*/5 * * * *", "", JobOptions::default()).unwrap();
        let job = s.get_job("A").unwrap();
        assert!(job.next_run().is_some_and(|t| t > Utc::now()));
        assert_eq!(job.history().capacity(), 5);
    }

    #[test]
    fn unknown_names_are_not_found() {
        let s = scheduler();
        assert!(matches!(s.remove_job("x"), Err(SchedulerError::NotFound(_))));
        assert!(matches!(s.pause_job("x"), Err(SchedulerError::NotFound(_))));
        assert!(matches!(s.resume_job("x"), Err(SchedulerError::NotFound(_))));
        assert!(matches!(s.get_job_status("x"), Err(SchedulerError::NotFound(_))));
        assert!(matches!(s.get_job_history("x", 0), Err(SchedulerError::NotFound(_))));
    }

    #[test]
    fn stats_follow_job_states() {
        let s = scheduler();
        s.add_job("a", "* * * * *", "UTC", JobOptions::default()).unwrap();
        s.add_job("b", "* * * * *", "UTC", JobOptions::default()).unwrap();
        s.pause_job("b").unwrap();

        let stats = s.stats();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.idle_jobs, 1);
        assert_eq!(stats.paused_jobs, 1);
        assert!(!stats.started);

        s.remove_job("b").unwrap();
        assert_eq!(s.stats().total_jobs, 1);
        assert_eq!(s.job_names(), vec!["a".to_string()]);
    }
}
