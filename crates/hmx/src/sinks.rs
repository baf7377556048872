//! 💾 Sinks: where finished partitions land.
//!
//! The heightmap is a flat file of `total_points` little-endian `u16`s. Partitions finish
//! in whatever order the backends feel like, so a sink is random-access: every write says
//! *where* it goes. Nobody appends. Nobody sorts. The offset is the truth.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::app_config::OutputConfig;

pub(crate) mod file_sink;
pub(crate) mod in_mem_sink;

pub use file_sink::FileSinkConfig;
pub(crate) use file_sink::FileSink;
pub(crate) use in_mem_sink::InMemorySink;

/// 🕳️ A fixed-size, random-access byte destination.
///
/// # Contract 📜
/// - The sink is created pre-sized to the full output length; untouched bytes read as zero.
/// - `write_at` puts `bytes` at `offset`. Writing past the end is an error, not a resize.
/// - `close` flushes. MUST be called. Skipping it is a bug, and also rude.
#[async_trait]
pub(crate) trait Sink: std::fmt::Debug + Send {
    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// 🎭 File or RAM. The collector never asks which.
#[derive(Debug)]
pub(crate) enum SinkBackend {
    File(FileSink),
    InMemory(InMemorySink),
}

impl SinkBackend {
    /// 🏗️ Open the configured output, pre-sized to `size` bytes.
    pub(crate) async fn from_config(config: &OutputConfig, size: u64) -> Result<Self> {
        Ok(match config {
            OutputConfig::File(file_config) => SinkBackend::File(FileSink::create(file_config, size).await?),
            OutputConfig::InMemory => SinkBackend::InMemory(InMemorySink::new(size)?),
        })
    }
}

/// 📍 Where a finished run's heightmap ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutput {
    File(PathBuf),
    InMemory(Vec<u8>),
}

/// 🔖 Kept by the supervisor while the collector owns the sink itself.
#[derive(Debug, Clone)]
pub(crate) enum OutputHandle {
    File(PathBuf),
    InMemory(InMemorySink),
}

impl OutputHandle {
    pub(crate) async fn into_output(self) -> RunOutput {
        match self {
            OutputHandle::File(path) => RunOutput::File(path),
            OutputHandle::InMemory(sink) => RunOutput::InMemory(sink.snapshot().await),
        }
    }
}

impl SinkBackend {
    pub(crate) fn handle(&self) -> OutputHandle {
        match self {
            SinkBackend::File(sink) => OutputHandle::File(sink.path().to_path_buf()),
            SinkBackend::InMemory(sink) => OutputHandle::InMemory(sink.clone()),
        }
    }
}

#[async_trait]
impl Sink for SinkBackend {
    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        match self {
            SinkBackend::File(sink) => sink.write_at(offset, bytes).await,
            SinkBackend::InMemory(sink) => sink.write_at(offset, bytes).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            SinkBackend::File(sink) => sink.close().await,
            SinkBackend::InMemory(sink) => sink.close().await,
        }
    }
}

/// 📏 Reject writes that would spill past the pre-sized end.
pub(crate) fn check_bounds(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| anyhow::anyhow!("💀 offset {offset} + {len} bytes overflows u64"))?;
    anyhow::ensure!(
        end <= size,
        "💀 write of {len} bytes at offset {offset} runs past the end of the {size}-byte output"
    );
    Ok(())
}
