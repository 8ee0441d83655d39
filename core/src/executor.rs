use std::future::Future;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::{ContextError, ExecContext};

/// Exit code reported when no process exit status is available.
pub const NO_EXIT_CODE: i32 = -1;

/// Outcome of a failed execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// No configuration registered under this job name.
    #[error("process {0:?} not registered")]
    NotRegistered(String),
    /// The configured command list is empty.
    #[error("process {0:?} has an empty command")]
    EmptyCommand(String),
    /// The process ran and exited with a non-zero status.
    #[error("process exited with code {code}")]
    NonZeroExit {
        /// Exit status reported by the OS.
        code: i32,
    },
    /// The process could not be started.
    #[error("failed to start process: {source}")]
    SpawnFailed {
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },
    /// The execution deadline elapsed before completion.
    #[error("execution timed out")]
    TimedOut,
    /// The caller cancelled the execution.
    #[error("execution cancelled")]
    Cancelled,
    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl ExecutionError {
    /// The exit code callers should record for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionError::NonZeroExit { code } => *code,
            _ => NO_EXIT_CODE,
        }
    }
}

impl From<ContextError> for ExecutionError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::DeadlineExceeded => ExecutionError::TimedOut,
            ContextError::Cancelled => ExecutionError::Cancelled,
        }
    }
}

/// Runs the work behind a job.
///
/// Implementations block until the work completes or `ctx` is done, and must
/// return promptly after cancellation. `Ok(code)` with a non-zero code counts
/// as an unsuccessful run without an error message.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute the work registered for `job`.
    async fn execute(&self, ctx: &ExecContext, job: &str) -> Result<i32, ExecutionError>;
}

type BoxedFn = dyn Fn(ExecContext, String) -> BoxFuture<'static, Result<i32, ExecutionError>>
    + Send
    + Sync;

/// Executor backed by an in-process async closure.
#[derive(Clone)]
pub struct FnExecutor {
    f: Arc<BoxedFn>,
}

impl FnExecutor {
    /// Wrap `f`; it receives the execution context and the job name.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ExecContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<i32, ExecutionError>> + Send + 'static,
    {
        Self { f: Arc::new(move |ctx, job| Box::pin(f(ctx, job))) }
    }
}

#[async_trait]
impl JobExecutor for FnExecutor {
    async fn execute(&self, ctx: &ExecContext, job: &str) -> Result<i32, ExecutionError> {
        (self.f)(ctx.clone(), job.to_string()).await
    }
}
