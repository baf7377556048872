use anyhow::{Context, Result, ensure};
use async_channel::Receiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Worker;
use crate::common::PartitionResult;
use crate::sinks::{Sink, SinkBackend};

/// 📨 What travels through the results queue.
#[derive(Debug)]
pub(crate) enum ResultItem {
    Partition(PartitionResult),
    /// 🏁 Sent once by the supervisor after the work queue has settled.
    EndOfStream,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CollectorReport {
    pub(crate) partitions_written: u64,
    pub(crate) samples_written: u64,
}

/// 📥 ResultCollector: the single writer.
///
/// Every result is written at `partition.start × 2`, whatever order it shows up in.
/// After each write the samples-done counter goes up and gets published for the
/// progress reporter. A write failure ends the collector with an error, which ends
/// the run.
#[derive(Debug)]
pub(crate) struct ResultCollector {
    rx: Receiver<ResultItem>,
    sink: SinkBackend,
    samples_done: watch::Sender<u64>,
}

impl ResultCollector {
    pub(crate) fn new(rx: Receiver<ResultItem>, sink: SinkBackend, samples_done: watch::Sender<u64>) -> Self {
        Self { rx, sink, samples_done }
    }
}

impl Worker for ResultCollector {
    type Report = CollectorReport;

    fn start(mut self) -> JoinHandle<Result<CollectorReport>> {
        tokio::spawn(async move {
            debug!("📥 result collector started draining the results queue");
            let mut report = CollectorReport::default();
            loop {
                match self.rx.recv().await {
                    Ok(ResultItem::Partition(result)) => {
                        let partition = result.partition;
                        ensure!(
                            result.bytes.len() == partition.byte_len(),
                            "💀 {} came back with {} bytes instead of {}",
                            partition,
                            result.bytes.len(),
                            partition.byte_len()
                        );
                        self.sink
                            .write_at(partition.byte_offset(), &result.bytes)
                            .await
                            .with_context(|| format!("💀 Result collector failed to write {partition}"))?;
                        report.partitions_written += 1;
                        report.samples_written += partition.len();
                        self.samples_done.send_replace(report.samples_written);
                        trace!("💾 wrote {} ({} samples so far)", partition, report.samples_written);
                    }
                    // -- sentinel or every sender dropped: either way, nothing more is coming
                    Ok(ResultItem::EndOfStream) | Err(_) => {
                        debug!("🏁 result collector done, closing the output");
                        self.sink.close().await.context("💀 Result collector failed to close the output")?;
                        return Ok(report);
                    }
                }
            }
        })
    }
}
