//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where terrain must be sampled one wagon at a time..."
//! 🎬 "One supervisor dared to manage them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor wires the whole run together:
//!
//! ```text
//!   probe backends ─▶ partition ─▶ WorkQueue ─▶ DispatchWorker × N ─▶ results ─▶ ResultCollector ─▶ output
//!                                                                                      │
//!                                                                          watch ─▶ progress reporter
//! ```
//!
//! ⚠️ DO NOT MAKE THE WORKERS PUB. They are the supervisor's private little minions.

mod work_queue;
mod workers;

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::app_config::AppConfig;
use crate::backends::BackendSession;
use crate::common::Partition;
use crate::missions::JobTemplate;
use crate::partitions::partition_points;
use crate::progress::{ProgressMetrics, spawn_reporter};
use crate::sinks::{RunOutput, Sink, SinkBackend};
use work_queue::{JoinOutcome, WorkItem, WorkQueue};
use workers::{DispatchReport, DispatchWorker, ResultCollector, ResultItem, Worker};

/// 🕳️ A partition that will stay zero-filled in the output, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPartition {
    pub backend: String,
    pub partition: Partition,
    pub reason: String,
}

/// 📡 A backend that never made it past the startup probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreachableBackend {
    pub backend: String,
    pub reason: String,
}

/// 🧾 Everything worth knowing about a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub output: RunOutput,
    pub total_samples: u64,
    pub samples_written: u64,
    pub elapsed: Duration,
    pub backends_used: Vec<String>,
    pub unreachable_backends: Vec<UnreachableBackend>,
    pub lost_backends: Vec<String>,
    pub failed_partitions: Vec<FailedPartition>,
    /// Partitions nobody ever ran, because every backend was gone by then.
    pub unprocessed_partitions: Vec<Partition>,
}

impl RunSummary {
    /// ✅ Every sample made it into the output.
    pub fn is_complete(&self) -> bool {
        self.samples_written == self.total_samples
    }
}

pub(crate) struct Supervisor {
    app_config: AppConfig,
}

impl Supervisor {
    pub(crate) fn new(app_config: AppConfig) -> Self {
        Self { app_config }
    }

    /// 🚀 One full pipeline run. See the module docs for the shape of it.
    pub(crate) async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let grid = &self.app_config.grid;
        let runtime = &self.app_config.runtime;
        // -- `hmx::run` takes configs built in code too, not just ones from `load_config`
        grid.validate().context("💀 The grid describes a map that cannot be sampled.")?;
        ensure!(
            runtime.max_objects_in_mission > 0,
            "💀 runtime.max_objects_in_mission must be at least 1."
        );
        let total = grid.total_points();
        let output_size = total * crate::common::SAMPLE_WIDTH as u64;
        info!("🗺️ sampling {} ({}×{} m at {} m): {} points", grid.loader, grid.height, grid.width, grid.scale, total);

        if total == 0 {
            // -- nothing to sample: an empty output, and no backend gets bothered
            let mut sink = SinkBackend::from_config(&self.app_config.output, 0).await?;
            let handle = sink.handle();
            sink.close().await?;
            return Ok(RunSummary {
                output: handle.into_output().await,
                total_samples: 0,
                samples_written: 0,
                elapsed: started.elapsed(),
                backends_used: Vec::new(),
                unreachable_backends: Vec::new(),
                lost_backends: Vec::new(),
                failed_partitions: Vec::new(),
                unprocessed_partitions: Vec::new(),
            });
        }

        let template = JobTemplate::from_grid(grid)?;
        let (sessions, unreachable_backends) = self.probe_backends().await;
        if sessions.is_empty() {
            bail!(
                "💀 no servers available: all {} configured backends are unreachable or busy",
                unreachable_backends.len()
            );
        }
        let backends_used: Vec<String> = sessions.iter().map(|s| s.address().to_string()).collect();
        info!("📡 {} of {} backends are ready", sessions.len(), self.app_config.backends.len());

        let partitions = partition_points(total, sessions.len() as u64, runtime.max_objects_in_mission)?;
        debug!("🔪 {} partitions for {} workers", partitions.len(), sessions.len());

        // 📥 collector + progress
        let sink = SinkBackend::from_config(&self.app_config.output, output_size).await?;
        let output_handle = sink.handle();
        let (results_tx, results_rx) = async_channel::bounded(runtime.queue_capacity.max(1));
        let (samples_done, samples_watch) = watch::channel(0u64);
        let reporter = spawn_reporter(
            samples_watch,
            ProgressMetrics::new(grid.map_name().to_string(), total, runtime.show_progress),
        );
        let collector = ResultCollector::new(results_rx, sink, samples_done).start();

        // 🚚 one worker per live backend
        let worker_count = sessions.len();
        let queue = WorkQueue::new(worker_count);
        let workers: Vec<_> = sessions
            .into_iter()
            .map(|session| DispatchWorker::new(session, template.clone(), queue.clone(), results_tx.clone()).start())
            .collect();

        // 📬 feed, then one sentinel per worker
        let mut fed = 0;
        for partition in &partitions {
            if queue.put(WorkItem::Partition(*partition)).await.is_err() {
                break;
            }
            fed += 1;
        }
        if fed == partitions.len() {
            for _ in 0..worker_count {
                if queue.put(WorkItem::EndOfStream).await.is_err() {
                    break;
                }
            }
        }
        let outcome = queue.join().await;
        let mut unprocessed_partitions = queue.drain_stranded();
        unprocessed_partitions.extend_from_slice(&partitions[fed..]);

        let mut reports: Vec<DispatchReport> = Vec::with_capacity(worker_count);
        for handle in workers {
            reports.push(handle.await.context("💀 a dispatch worker panicked")??);
        }

        // 🏁 every result is queued by now; the collector's sentinel goes in last
        let _ = results_tx.send(ResultItem::EndOfStream).await;
        drop(results_tx);
        let collected = collector.await.context("💀 the result collector panicked")??;
        let _ = reporter.await;

        let lost_backends: Vec<String> = reports.iter().filter(|r| r.lost).map(|r| r.backend.clone()).collect();
        let failed_partitions: Vec<FailedPartition> = reports.iter().flat_map(|r| r.failed.iter().cloned()).collect();
        let completed: usize = reports.iter().map(|r| r.completed.len()).sum();
        debug!("📦 {} partitions completed, {} collected", completed, collected.partitions_written);

        let summary = RunSummary {
            output: output_handle.into_output().await,
            total_samples: total,
            samples_written: collected.samples_written,
            elapsed: started.elapsed(),
            backends_used,
            unreachable_backends,
            lost_backends,
            failed_partitions,
            unprocessed_partitions,
        };

        if outcome == JoinOutcome::Abandoned || summary.lost_backends.len() == worker_count {
            error!(
                "💀 every backend was lost; {} samples of {} made it to the output",
                summary.samples_written, summary.total_samples
            );
            bail!(
                "💀 every backend was lost mid-run: {} partitions failed and {} were never processed",
                summary.failed_partitions.len(),
                summary.unprocessed_partitions.len()
            );
        }
        for gap in &summary.failed_partitions {
            warn!("🕳️ gap at {} ({}): {}", gap.partition, gap.backend, gap.reason);
        }
        info!(
            "✅ run finished in {:.1?}: {} of {} samples written",
            summary.elapsed, summary.samples_written, summary.total_samples
        );
        Ok(summary)
    }

    /// 📡 Probe every configured backend at once. Ready ones come back as sessions.
    async fn probe_backends(&self) -> (Vec<BackendSession>, Vec<UnreachableBackend>) {
        let probes = self.app_config.backends.iter().map(|config| async move {
            let mut session = match BackendSession::from_config(config) {
                Ok(session) => session,
                Err(err) => {
                    return Err(UnreachableBackend {
                        backend: config.label(),
                        reason: format!("{err:#}"),
                    });
                }
            };
            match session.connect().await {
                Ok(()) => Ok(session),
                Err(err) => Err(UnreachableBackend {
                    backend: session.address().to_string(),
                    reason: err.to_string(),
                }),
            }
        });

        let mut sessions = Vec::new();
        let mut unreachable = Vec::new();
        for probe in join_all(probes).await {
            match probe {
                Ok(session) => sessions.push(session),
                Err(backend) => {
                    warn!("📡 backend {} is not available: {}", backend.backend, backend.reason);
                    unreachable.push(backend);
                }
            }
        }
        (sessions, unreachable)
    }
}
