use std::sync::Arc;

use overseer_core::Scheduler;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ModuleCtx {
    pub scheduler: Arc<Scheduler>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
