mod heartbeat;
mod module;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use overseer_core::cfg::{self, AppId, Config};
use overseer_core::logsink::MemorySinkFactory;
use overseer_core::logx;
use overseer_core::{ProcessExecutor, Scheduler};
use tracing::{error, info, warn};

use crate::heartbeat::Heartbeat;
use crate::module::{Module, ModuleCtx};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name=env!("CARGO_PKG_NAME"), version, about="Cron-driven process supervisor")]
struct Cli {
    /// Config file (defaults to config.toml in the app config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Validate the config, print each job's next run and exit
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => cfg::load(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    let level = match cli.verbose { 0 => cfg.log_level.as_str(), 1 => "debug", _ => "trace" };
    logx::init_with(level, cfg.log_format);

    let scheduler = Arc::new(build_scheduler(&cfg)?);
    if cli.check {
        for status in scheduler.get_all_job_statuses() {
            let next = status.next_run.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
            println!("{}\t{}\t{}\t{}", status.name, status.schedule, status.timezone, next);
        }
        return Ok(());
    }

    build_runtime()?.block_on(serve(scheduler, &cfg))
}

fn build_scheduler(cfg: &Config) -> Result<Scheduler> {
    let executor = Arc::new(ProcessExecutor::with_sink_factory(Arc::new(MemorySinkFactory)));
    let scheduler = Scheduler::with_history_size(executor.clone(), cfg.history_size);
    for job in &cfg.jobs {
        executor
            .register_process(&job.name, job.process_config())
            .with_context(|| format!("register process {}", job.name))?;
        scheduler
            .add_job(&job.name, &job.schedule, &job.timezone, job.job_options())
            .with_context(|| format!("add job {}", job.name))?;
    }
    Ok(scheduler)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    let rt = if cfg!(feature = "rt-single") {
        tokio::runtime::Builder::new_current_thread().enable_all().build()
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get().max(2))
            .enable_all()
            .build()
    };
    rt.context("build tokio runtime")
}

async fn serve(scheduler: Arc<Scheduler>, cfg: &Config) -> Result<()> {
    info!("{} boot jobs={}", APP.application, scheduler.job_names().len());
    scheduler.start();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ctx = ModuleCtx { scheduler: scheduler.clone(), shutdown: shutdown_rx };

    let mut modules: Vec<Box<dyn Module>> = Vec::new();
    if cfg.status_interval_secs > 0 {
        modules.push(Box::new(Heartbeat::new(Duration::from_secs(cfg.status_interval_secs))));
    }
    let handles: Vec<_> = modules
        .into_iter()
        .map(|m| (m.name(), m.spawn(ctx.clone())))
        .collect();

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    scheduler.stop().wait().await;
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(module = name, "module failed: {e:#}"),
            Err(e) => error!(module = name, "module panicked: {e}"),
        }
    }
    info!("{} stopped", APP.application);
    Ok(())
}
