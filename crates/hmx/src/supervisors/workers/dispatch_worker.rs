use anyhow::Result;
use async_channel::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Worker;
use super::result_collector::ResultItem;
use crate::backends::BackendSession;
use crate::common::{Partition, PartitionResult};
use crate::missions::JobTemplate;
use crate::supervisors::FailedPartition;
use crate::supervisors::work_queue::{WorkItem, WorkQueue};

/// 🚚 What one dispatch worker got done before it went home (or didn't).
#[derive(Debug, Clone, Default)]
pub(crate) struct DispatchReport {
    pub(crate) backend: String,
    pub(crate) completed: Vec<Partition>,
    pub(crate) failed: Vec<FailedPartition>,
    /// 🪦 The backend dropped out and the worker departed early.
    pub(crate) lost: bool,
}

/// 🚚 DispatchWorker: binds one backend session to the shared work queue.
///
/// Loop: take an item; a sentinel ends the shift. A partition is executed on the session.
/// Success goes into the results queue *before* the item is acknowledged, so once
/// `join` returns every result is already queued ahead of the collector's sentinel.
///
/// Failure policy:
/// - execution error or busy: that partition is a gap, keep going
/// - connection error: that partition is a gap, depart, go home
#[derive(Debug)]
pub(crate) struct DispatchWorker {
    session: BackendSession,
    template: JobTemplate,
    queue: WorkQueue,
    results: Sender<ResultItem>,
}

impl DispatchWorker {
    pub(crate) fn new(
        session: BackendSession,
        template: JobTemplate,
        queue: WorkQueue,
        results: Sender<ResultItem>,
    ) -> Self {
        Self {
            session,
            template,
            queue,
            results,
        }
    }
}

impl Worker for DispatchWorker {
    type Report = DispatchReport;

    fn start(mut self) -> JoinHandle<Result<DispatchReport>> {
        tokio::spawn(async move {
            let mut report = DispatchReport {
                backend: self.session.address().to_string(),
                ..DispatchReport::default()
            };
            debug!("🚚 dispatch worker for {} clocking in", report.backend);

            while let Some(item) = self.queue.get().await {
                let partition = match item {
                    WorkItem::EndOfStream => {
                        self.queue.task_done();
                        debug!("🏁 dispatch worker for {} got its sentinel", report.backend);
                        break;
                    }
                    WorkItem::Partition(partition) => partition,
                };

                match self.session.execute(partition, &self.template).await {
                    Ok(bytes) => {
                        let result = ResultItem::Partition(PartitionResult { partition, bytes });
                        if self.results.send(result).await.is_err() {
                            // -- the collector is gone; nothing we produce can land anywhere
                            warn!("💀 results queue closed, {} stops dispatching", report.backend);
                            report.failed.push(FailedPartition {
                                backend: report.backend.clone(),
                                partition,
                                reason: "result collector stopped".to_string(),
                            });
                            self.queue.task_done();
                            self.queue.depart();
                            return Ok(report);
                        }
                        report.completed.push(partition);
                        self.queue.task_done();
                    }
                    Err(err) => {
                        let connection_lost = err.is_connection();
                        warn!("🕳️ partition {} on {} becomes a gap: {}", partition, report.backend, err);
                        report.failed.push(FailedPartition {
                            backend: report.backend.clone(),
                            partition,
                            reason: err.to_string(),
                        });
                        self.queue.task_done();
                        if connection_lost {
                            info!("🪦 backend {} is gone, its worker leaves the pool", report.backend);
                            report.lost = true;
                            self.queue.depart();
                            return Ok(report);
                        }
                    }
                }
            }

            debug!(
                "👋 dispatch worker for {} clocking out: {} done, {} gaps",
                report.backend,
                report.completed.len(),
                report.failed.len()
            );
            Ok(report)
        })
    }
}
