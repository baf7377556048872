//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all
//! the credit in the sprint retro.
//!
//! Two kinds:
//! - [`DispatchWorker`]: one per live backend. Pulls partitions, runs them, pushes results.
//! - [`ResultCollector`]: exactly one. Pulls results, writes them at their offsets.

use anyhow::Result;
use tokio::task::JoinHandle;

mod dispatch_worker;
mod result_collector;

pub(crate) use dispatch_worker::{DispatchReport, DispatchWorker};
pub(crate) use result_collector::{CollectorReport, ResultCollector, ResultItem};

/// 🏗️ A background worker, that does work. duh.
///
/// `start` consumes the worker and hands back the JoinHandle, because we trust
/// but verify. Mostly verify.
pub(crate) trait Worker {
    type Report;

    fn start(self) -> JoinHandle<Result<Self::Report>>;
}
