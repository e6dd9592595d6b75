//! 🧵 Workers: background tasks the supervisor (and the live merge) hand work to.
//!
//! Each worker owns its inputs, runs on its own task, and reports back through a
//! `JoinHandle<Result<()>>`. Nobody shares a worker. Nobody pubs a worker outside
//! this crate either. 🦆

use anyhow::Result;
use tokio::task::JoinHandle;

mod live_worker;
pub(crate) use live_worker::LiveWorker;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    /// 🚀 Spawns the worker and hands back its handle.
    fn start(self) -> JoinHandle<Result<()>>;
}
