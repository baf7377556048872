//! 🧠 The in-memory backend: a game server that lives entirely in RAM.
//!
//! It keeps the same stateful side-channel shape as the real thing: missions get
//! "uploaded" into a map, one gets "loaded", the radar reports wagon heights for the
//! loaded one, cleanup throws it away. The terrain is a deterministic function of
//! world position, so tests can compute exactly what the output file should contain.
//!
//! 🧨 It also misbehaves on request: unreachable, busy, failing specific jobs,
//! vanishing mid-job, or answering one sample short. For tests, and for dry runs
//! when the real servers are asleep.
//!
//! ⚠️ This is NOT for production. If you're deploying this to prod, please also deploy a therapist.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::trace;

use crate::backends::{SessionError, SessionStep, Transport};
use crate::common::Partition;
use crate::missions::{Job, JobTemplate};
use crate::partitions::GridGeometry;

#[derive(Debug, Deserialize, Clone)]
pub struct InMemoryBackendConfig {
    /// 🏷️ Shows up in logs and run summaries.
    #[serde(default = "default_name")]
    pub name: String,
    /// 🚫 Refuse every connection.
    #[serde(default)]
    pub unreachable: bool,
    /// 🙅 Answer every connection with "busy".
    #[serde(default)]
    pub busy: bool,
    /// 💥 1-based job numbers whose fetch fails (backend stays up).
    #[serde(default)]
    pub fail_on_jobs: Vec<u64>,
    /// 🪦 From this 1-based job number on, the backend is gone.
    #[serde(default)]
    pub disconnect_on_job: Option<u64>,
    /// 🐌 Artificial delay per fetch.
    #[serde(default)]
    pub latency_ms: u64,
    /// ✂️ Answer this many samples short. Rude, but it happens.
    #[serde(default)]
    pub drop_samples: usize,
}

fn default_name() -> String {
    "in-memory".to_string()
}

impl Default for InMemoryBackendConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            unreachable: false,
            busy: false,
            fail_on_jobs: Vec::new(),
            disconnect_on_job: None,
            latency_ms: 0,
            drop_samples: 0,
        }
    }
}

/// ⛰️ The in-memory world's terrain: gentle diagonal ridges that repeat every 4 km of "height".
pub(crate) fn synthetic_height(x: u64, y: u64) -> f64 {
    (((x / 100) * 7 + (y / 100) * 13) % 4000) as f64
}

#[derive(Debug)]
pub(crate) struct InMemoryTransport {
    config: InMemoryBackendConfig,
    uploaded: HashMap<String, (Partition, GridGeometry)>,
    loaded: Option<String>,
    jobs_started: u64,
    gone: bool,
}

impl InMemoryTransport {
    pub(crate) fn new(config: InMemoryBackendConfig) -> Self {
        Self {
            config,
            uploaded: HashMap::new(),
            loaded: None,
            jobs_started: 0,
            gone: false,
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.config.name
    }

    fn reachable(&self) -> Result<(), SessionError> {
        if self.config.unreachable || self.gone {
            return Err(SessionError::connection(anyhow!(
                "in-memory backend '{}' is not answering",
                self.config.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&mut self) -> Result<(), SessionError> {
        self.reachable()?;
        if self.config.busy {
            return Err(SessionError::Busy);
        }
        Ok(())
    }

    async fn send_job(&mut self, job: &Job, template: &JobTemplate) -> Result<(), SessionError> {
        self.reachable()?;
        if self.config.busy {
            return Err(SessionError::Busy);
        }
        self.jobs_started += 1;
        trace!("🧠 #{} '{}' uploaded to {}", self.jobs_started, job.file_name, self.config.name);
        self.uploaded
            .insert(job.file_name.clone(), (job.partition, template.geometry));
        Ok(())
    }

    async fn trigger(&mut self, job: &Job) -> Result<(), SessionError> {
        self.reachable()?;
        if !self.uploaded.contains_key(&job.file_name) {
            return Err(SessionError::execution(
                SessionStep::Trigger,
                anyhow!("mission '{}' was never uploaded", job.file_name),
            ));
        }
        self.loaded = Some(job.file_name.clone());
        Ok(())
    }

    async fn stream_results(&mut self, job: &Job) -> Result<Vec<f64>, SessionError> {
        self.reachable()?;
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
        if self
            .config
            .disconnect_on_job
            .is_some_and(|job_number| self.jobs_started >= job_number)
        {
            self.gone = true;
            return Err(SessionError::connection(anyhow!(
                "in-memory backend '{}' dropped the connection during job #{}",
                self.config.name,
                self.jobs_started
            )));
        }
        if self.config.fail_on_jobs.contains(&self.jobs_started) {
            return Err(SessionError::execution(
                SessionStep::Fetch,
                anyhow!("radar refused to answer for job #{}", self.jobs_started),
            ));
        }

        let (partition, geometry) = self
            .loaded
            .as_ref()
            .filter(|loaded| **loaded == job.file_name)
            .and_then(|loaded| self.uploaded.get(loaded))
            .copied()
            .ok_or_else(|| {
                SessionError::execution(
                    SessionStep::Fetch,
                    anyhow!("mission '{}' is not the loaded one", job.file_name),
                )
            })?;

        let mut heights: Vec<f64> = partition
            .indices()
            .map(|idx| {
                let (x, y) = geometry.index_to_point(idx);
                synthetic_height(x, y)
            })
            .collect();
        heights.truncate(heights.len().saturating_sub(self.config.drop_samples));
        Ok(heights)
    }

    async fn cleanup(&mut self, job: &Job) -> Result<(), SessionError> {
        self.reachable()?;
        if self.loaded.as_deref() == Some(job.file_name.as_str()) {
            self.loaded = None;
        }
        self.uploaded.remove(&job.file_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitions::VerticalFlip;

    fn template() -> JobTemplate {
        JobTemplate::new(
            "Test/load.ini",
            GridGeometry {
                height: 1000,
                width: 1000,
                scale: 100,
                flip: VerticalFlip::None,
                cell_center: false,
            },
        )
    }

    #[tokio::test]
    async fn the_one_where_the_side_channel_is_stateful() -> anyhow::Result<()> {
        let template = template();
        let mut transport = InMemoryTransport::new(InMemoryBackendConfig::default());
        let job = template.build(Partition::new(0, 4)?);

        // 🧪 fetching before anything is loaded is an error, like the real thing
        assert!(transport.stream_results(&job).await.is_err());

        transport.send_job(&job, &template).await?;
        transport.trigger(&job).await?;
        let heights = transport.stream_results(&job).await?;
        assert_eq!(heights, vec![0.0, 7.0, 14.0, 21.0, 28.0]);

        transport.cleanup(&job).await?;
        assert!(transport.uploaded.is_empty());
        assert!(transport.loaded.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_busy_and_unreachable_are_different_things() {
        let mut busy = InMemoryTransport::new(InMemoryBackendConfig {
            busy: true,
            ..InMemoryBackendConfig::default()
        });
        assert!(matches!(busy.connect().await, Err(SessionError::Busy)));

        let mut unreachable = InMemoryTransport::new(InMemoryBackendConfig {
            unreachable: true,
            ..InMemoryBackendConfig::default()
        });
        assert!(matches!(unreachable.connect().await, Err(SessionError::Connection(_))));
    }
}
