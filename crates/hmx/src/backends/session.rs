//! 🎟️ BackendSession: one exclusive seat at one game server.
//!
//! The session owns its transport outright and drives it through the job dance:
//!
//! ```text
//!   Idle ─▶ Uploading ─▶ Triggered ─▶ Fetching ─▶ Cleaning ─▶ Idle
//!     ▲          │            │            │
//!     └──────────┴──── Failed ◀────────────┘   (terminal for that partition only)
//! ```
//!
//! `execute` takes `&mut self`, so the borrow checker enforces "one job in flight per
//! backend" for free. No mutex. No flag. No 3am race condition. 🔒

use tracing::{debug, trace, warn};

use crate::app_config::BackendConfig;
use crate::backends::{SessionError, SessionStep, Transport, TransportBackend};
use crate::common::{Partition, Sample, pack_samples, to_sample};
use crate::missions::{Job, JobTemplate};

/// 🚦 Where a session is in the job dance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Uploading,
    Triggered,
    Fetching,
    Cleaning,
    Failed,
}

#[derive(Debug)]
pub(crate) struct BackendSession {
    address: String,
    transport: TransportBackend,
    state: SessionState,
}

impl BackendSession {
    pub(crate) fn new(transport: TransportBackend) -> Self {
        Self {
            address: transport.address(),
            transport,
            state: SessionState::Idle,
        }
    }

    pub(crate) fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        Ok(Self::new(TransportBackend::from_config(config)?))
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// 📡 Probe the backend. Reachable and free → `Ok`.
    pub(crate) async fn connect(&mut self) -> Result<(), SessionError> {
        debug!("📡 probing backend {}", self.address);
        self.transport.connect().await
    }

    /// 🚀 Run one partition and return its packed bytes, `partition.byte_len()` long.
    pub(crate) async fn execute(
        &mut self,
        partition: Partition,
        template: &JobTemplate,
    ) -> Result<Vec<u8>, SessionError> {
        let samples = self.execute_samples(partition, template).await?;
        Ok(pack_samples(&samples))
    }

    /// 🚀 Run one partition and return one [`Sample`] per index, in index order.
    pub(crate) async fn execute_samples(
        &mut self,
        partition: Partition,
        template: &JobTemplate,
    ) -> Result<Vec<Sample>, SessionError> {
        // -- a failed previous partition does not poison the next one
        self.state = SessionState::Idle;
        debug!("🗺️ query range {} on backend {}", partition, self.address);
        let job = template.build(partition);

        self.advance(SessionState::Uploading);
        if let Err(err) = self.transport.send_job(&job, template).await {
            return Err(self.fail(&job, err).await);
        }

        self.advance(SessionState::Triggered);
        if let Err(err) = self.transport.trigger(&job).await {
            return Err(self.fail(&job, err).await);
        }

        self.advance(SessionState::Fetching);
        let heights = match self.transport.stream_results(&job).await {
            Ok(heights) => heights,
            Err(err) => return Err(self.fail(&job, err).await),
        };

        self.advance(SessionState::Cleaning);
        self.cleanup_best_effort(&job).await;
        self.advance(SessionState::Idle);

        let expected = partition.len() as usize;
        if heights.len() != expected {
            self.state = SessionState::Failed;
            return Err(SessionError::execution(
                SessionStep::Decode,
                anyhow::anyhow!(
                    "backend {} returned {} samples for {} which holds {}",
                    self.address,
                    heights.len(),
                    partition,
                    expected
                ),
            ));
        }

        trace!("📦 {} samples for {} from {}", heights.len(), partition, self.address);
        Ok(heights.into_iter().map(to_sample).collect())
    }

    fn advance(&mut self, next: SessionState) {
        trace!("🚦 {}: {:?} → {:?}", self.address, self.state, next);
        self.state = next;
    }

    /// 💀 Mark the partition failed. Unless the backend itself is gone, tidy up after ourselves.
    async fn fail(&mut self, job: &Job, err: SessionError) -> SessionError {
        if !err.is_connection() {
            self.cleanup_best_effort(job).await;
        }
        self.state = SessionState::Failed;
        err
    }

    /// 🧹 Cleanup failures get logged, never propagated. A leftover mission file is litter, not a fire.
    async fn cleanup_best_effort(&mut self, job: &Job) {
        if let Err(err) = self.transport.cleanup(job).await {
            warn!(
                "🧹 cleanup of '{}' on backend {} failed, moving on: {}",
                job.file_name, self.address, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBackendConfig;
    use crate::backends::in_mem::{InMemoryTransport, synthetic_height};
    use crate::common::unpack_samples;
    use crate::partitions::{GridGeometry, VerticalFlip};

    fn template() -> JobTemplate {
        JobTemplate::new(
            "Kuban/load.ini",
            GridGeometry {
                height: 2000,
                width: 2000,
                scale: 100,
                flip: VerticalFlip::None,
                cell_center: false,
            },
        )
    }

    fn session(config: InMemoryBackendConfig) -> BackendSession {
        BackendSession::new(TransportBackend::InMemory(InMemoryTransport::new(config)))
    }

    #[tokio::test]
    async fn the_one_where_a_partition_comes_back_packed_and_in_order() -> anyhow::Result<()> {
        let template = template();
        let mut session = session(InMemoryBackendConfig::default());
        let partition = Partition::new(15, 44)?;

        let bytes = session.execute(partition, &template).await?;
        assert_eq!(bytes.len(), partition.byte_len());
        let expected: Vec<Sample> = partition
            .indices()
            .map(|idx| {
                let (x, y) = template.geometry.index_to_point(idx);
                to_sample(synthetic_height(x, y))
            })
            .collect();
        assert_eq!(unpack_samples(&bytes), expected);
        assert_eq!(session.state(), SessionState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_fetch_fails_only_that_partition() -> anyhow::Result<()> {
        let template = template();
        let mut session = session(InMemoryBackendConfig {
            fail_on_jobs: vec![1],
            ..InMemoryBackendConfig::default()
        });

        let err = session
            .execute(Partition::new(0, 9)?, &template)
            .await
            .expect_err("job #1 is rigged to fail");
        assert!(matches!(err, SessionError::Execution { step: SessionStep::Fetch, .. }));
        assert_eq!(session.state(), SessionState::Failed);

        // 🧪 the next partition runs fine on the same session
        let bytes = session.execute(Partition::new(10, 19)?, &template).await?;
        assert_eq!(bytes.len(), 20);
        assert_eq!(session.state(), SessionState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_vanished_backend_is_a_connection_error() -> anyhow::Result<()> {
        let template = template();
        let mut session = session(InMemoryBackendConfig {
            disconnect_on_job: Some(1),
            ..InMemoryBackendConfig::default()
        });
        let err = session
            .execute(Partition::new(0, 9)?, &template)
            .await
            .expect_err("the backend leaves mid-job");
        assert!(err.is_connection());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_short_answer_is_refused() -> anyhow::Result<()> {
        let template = template();
        let mut session = session(InMemoryBackendConfig {
            drop_samples: 1,
            ..InMemoryBackendConfig::default()
        });
        let err = session
            .execute(Partition::new(0, 9)?, &template)
            .await
            .expect_err("one sample short must never reach the output");
        assert!(matches!(err, SessionError::Execution { step: SessionStep::Decode, .. }));
        Ok(())
    }
}
