use crate::module::{Module, ModuleCtx};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::info;

/// Periodically logs the scheduler's job tally.
pub struct Heartbeat { period: Duration }
impl Heartbeat { pub fn new(period: Duration) -> Self { Self { period } } }

impl Module for Heartbeat {
    fn name(&self) -> &'static str { "heartbeat" }
    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut tick = interval(self.period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let s = ctx.scheduler.stats();
                        info!(
                            total = s.total_jobs,
                            idle = s.idle_jobs,
                            executing = s.executing_jobs,
                            paused = s.paused_jobs,
                            "scheduler status"
                        );
                        for status in ctx.scheduler.get_all_job_statuses() {
                            info!(
                                job = %status.name,
                                state = %status.state,
                                next_run = ?status.next_run,
                                runs = status.stats.total_executions,
                                success_rate = status.stats.success_rate,
                                "job status"
                            );
                        }
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            info!("heartbeat stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}
