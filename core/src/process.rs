//! Default executor: runs each job as an OS process.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::context::ExecContext;
use crate::executor::{ExecutionError, JobExecutor};
use crate::logsink::{LogEntry, LogSink, SinkFactory, Stream};

/// Set in the child environment to the registered process name.
pub const ENV_PROCESS_NAME: &str = "OVERSEER_PROCESS_NAME";
/// Set in the child environment to mark scheduler-invoked runs.
pub const ENV_SCHEDULED: &str = "OVERSEER_SCHEDULED";

// Upper bound on waiting for output pumps once the child is gone.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

/// How to run one job's process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessConfig {
    /// Executable followed by its arguments.
    pub command: Vec<String>,
    /// Working directory; inherits ours when `None`.
    pub working_dir: Option<PathBuf>,
    /// Variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Process-level deadline, independent of the job's own timeout. Zero is unbounded.
    pub timeout: Option<Duration>,
    /// Log entries kept by the sink.
    pub log_capacity: Option<usize>,
    /// Regex patterns masked in captured output.
    pub redact: Vec<String>,
}

impl ProcessConfig {
    /// Config running `command` with everything else defaulted.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { command: command.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    /// Run in `dir`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Bound each run to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Registration failure.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The sink factory rejected the config.
    #[error("create log sink for process {name:?}")]
    Sink {
        /// Process name.
        name: String,
        /// Factory error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

struct Registered {
    config: ProcessConfig,
    sink: Option<Arc<dyn LogSink>>,
}

/// [`JobExecutor`] spawning OS processes, keyed by job name.
#[derive(Default)]
pub struct ProcessExecutor {
    processes: RwLock<HashMap<String, Registered>>,
    sinks: Option<Arc<dyn SinkFactory>>,
}

impl ProcessExecutor {
    /// Executor without output capture beyond our own stdio.
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor creating a sink per registered process.
    pub fn with_sink_factory(factory: Arc<dyn SinkFactory>) -> Self {
        Self { processes: RwLock::new(HashMap::new()), sinks: Some(factory) }
    }

    /// Register (or replace) the process run for job `name`.
    pub fn register_process(&self, name: &str, config: ProcessConfig) -> Result<(), ProcessError> {
        let sink = match &self.sinks {
            Some(factory) => Some(
                factory
                    .create(name, &config)
                    .map_err(|e| ProcessError::Sink { name: name.to_string(), source: e.into() })?,
            ),
            None => None,
        };
        debug!(process = name, command = ?config.command, "process registered");
        self.processes.write().insert(name.to_string(), Registered { config, sink });
        Ok(())
    }

    /// Forget `name`; unknown names are ignored.
    pub fn unregister_process(&self, name: &str) {
        self.processes.write().remove(name);
    }

    /// True if `name` is registered.
    pub fn has_process(&self, name: &str) -> bool {
        self.processes.read().contains_key(name)
    }

    /// Captured log entries for `name`, newest first. `limit == 0` returns all.
    pub fn get_logs(&self, name: &str, limit: usize) -> Vec<LogEntry> {
        let sink = self.processes.read().get(name).and_then(|p| p.sink.clone());
        let Some(sink) = sink else { return Vec::new() };
        let mut entries = sink.recent(limit);
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }

    async fn run(
        &self,
        ctx: &ExecContext,
        name: &str,
        config: &ProcessConfig,
        sink: Option<Arc<dyn LogSink>>,
    ) -> Result<i32, ExecutionError> {
        let Some((program, args)) = config.command.split_first() else {
            return Err(ExecutionError::EmptyCommand(name.to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&config.env)
            .env(ENV_PROCESS_NAME, name)
            .env(ENV_SCHEDULED, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        emit(&sink, &format!("starting: {}", config.command.join(" ")));
        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                emit(&sink, &format!("failed to start: {source}"));
                warn!(process = name, "failed to start: {source}");
                return Err(ExecutionError::SpawnFailed { source });
            }
        };
        info!(process = name, pid = child.id(), "process started");

        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(out, tokio::io::stdout(), Stream::Stdout, sink.clone())));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(err, tokio::io::stderr(), Stream::Stderr, sink.clone())));
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = ctx.done() => None,
        };
        let outcome = match waited {
            Some(Ok(status)) => exit_outcome(status, ctx),
            Some(Err(e)) => Err(ExecutionError::Other(format!("wait for process: {e}"))),
            None => {
                if let Err(e) = child.kill().await {
                    debug!(process = name, "kill: {e}");
                }
                Err(ctx.err().map(ExecutionError::from).unwrap_or(ExecutionError::Cancelled))
            }
        };

        // A grandchild may still hold the pipes; give the pumps a bounded drain, then stop them.
        let aborts: Vec<_> = pumps.iter().map(|p| p.abort_handle()).collect();
        let drained = tokio::time::timeout(PUMP_DRAIN, async {
            for pump in pumps {
                let _ = pump.await;
            }
        })
        .await;
        if drained.is_err() {
            debug!(process = name, "output still open after exit, dropping it");
            aborts.iter().for_each(|a| a.abort());
        }

        let elapsed = started.elapsed();
        match &outcome {
            Ok(code) => emit(&sink, &format!("exited normally with code {code} after {elapsed:?}")),
            Err(ExecutionError::NonZeroExit { code }) => {
                emit(&sink, &format!("exited with code {code} after {elapsed:?}"))
            }
            Err(ExecutionError::TimedOut) => emit(&sink, &format!("timeout exceeded after {elapsed:?}")),
            Err(ExecutionError::Cancelled) => emit(&sink, &format!("cancelled after {elapsed:?}")),
            Err(e) => emit(&sink, &format!("failed: {e}")),
        }
        outcome
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, ctx: &ExecContext, job: &str) -> Result<i32, ExecutionError> {
        let (config, sink) = {
            let processes = self.processes.read();
            let registered = processes
                .get(job)
                .ok_or_else(|| ExecutionError::NotRegistered(job.to_string()))?;
            (registered.config.clone(), registered.sink.clone())
        };
        let ctx = match config.timeout.filter(|t| !t.is_zero()) {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let result = self.run(&ctx, job, &config, sink.clone()).await;
        if let Some(sink) = &sink {
            sink.flush();
        }
        result
    }
}

// Exit status first, then the deadline, then cancellation.
fn exit_outcome(status: ExitStatus, ctx: &ExecContext) -> Result<i32, ExecutionError> {
    match status.code() {
        Some(0) => Ok(0),
        Some(code) => Err(ExecutionError::NonZeroExit { code }),
        None => Err(match ctx.err() {
            Some(e) => e.into(),
            None => ExecutionError::Other(format!("process terminated: {status}")),
        }),
    }
}

fn emit(sink: &Option<Arc<dyn LogSink>>, message: &str) {
    if let Some(sink) = sink {
        sink.event(message);
    }
}

async fn pump<R, W>(reader: R, mut echo: W, stream: Stream, sink: Option<Arc<dyn LogSink>>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let _ = echo.write_all(&buf).await;
                if let Some(sink) = &sink {
                    sink.write(stream, &String::from_utf8_lossy(&buf));
                }
            }
        }
    }
    let _ = echo.flush().await;
}
