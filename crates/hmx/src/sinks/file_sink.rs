use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::sinks::{Sink, check_bounds};

// -- 🚰 FileSinkConfig lives next to its FileSink. One sink = one config = one file.
#[derive(Debug, Deserialize, Clone)]
pub struct FileSinkConfig {
    #[serde(default = "default_file_name")]
    pub file_name: PathBuf,
}

fn default_file_name() -> PathBuf {
    PathBuf::from("heightmap.raw")
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            file_name: default_file_name(),
        }
    }
}

/// 🚰 FileSink: seek, write, repeat. The file is created at full size up front, so
/// partitions that never arrive stay as zero bytes at the right offsets.
///
/// ⚠️ An existing file at the same path is truncated. No warning. No backup. Just gone.
#[derive(Debug)]
pub(crate) struct FileSink {
    file: File,
    path: PathBuf,
    size: u64,
}

impl FileSink {
    pub(crate) async fn create(config: &FileSinkConfig, size: u64) -> Result<Self> {
        let path = config.file_name.clone();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("💀 Could not create output directory '{}'.", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .with_context(|| {
                format!(
                    "💀 The output file '{}' could not be conjured into existence. \
                     We stared at the path. The path stared back.",
                    path.display()
                )
            })?;
        file.set_len(size)
            .await
            .with_context(|| format!("💀 Could not size '{}' to {size} bytes. Disk full? Disk sad?", path.display()))?;
        debug!("💾 output '{}' created, {} bytes", path.display(), size);
        Ok(Self { file, path, size })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        check_bounds(offset, bytes.len(), self.size)?;
        trace!("📬 {} bytes at offset {} of '{}'", bytes.len(), offset, self.path.display());
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("💀 seek to {offset} in '{}' failed", self.path.display()))?;
        self.file
            .write_all(bytes)
            .await
            .with_context(|| format!("💀 write at {offset} in '{}' failed", self.path.display()))?;
        Ok(())
    }

    /// 🗑️ Flush and sync. Async Drop is not a thing, so this has to be explicit.
    async fn close(&mut self) -> Result<()> {
        trace!("🎬 final flush of '{}'", self.path.display());
        self.file.flush().await.context("💀 Error flushing the output file")?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("💀 Error syncing '{}' to disk", self.path.display()))?;
        Ok(())
    }
}
