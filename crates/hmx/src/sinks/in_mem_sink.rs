use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::sinks::{Sink, check_bounds};

/// 🧠 A heightmap that never touches disk. Clone it before handing it off and the
/// clone sees every byte the collector writes.
#[derive(Debug, Clone)]
pub(crate) struct InMemorySink {
    pub(crate) bytes: Arc<Mutex<Vec<u8>>>,
}

impl InMemorySink {
    pub(crate) fn new(size: u64) -> Result<Self> {
        let size = usize::try_from(size)
            .map_err(|_| anyhow::anyhow!("💀 {size} bytes will not fit in memory on this machine"))?;
        Ok(Self {
            bytes: Arc::new(Mutex::new(vec![0; size])),
        })
    }

    pub(crate) async fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().await.clone()
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut buffer = self.bytes.lock().await;
        check_bounds(offset, bytes.len(), buffer.len() as u64)?;
        let start = offset as usize;
        buffer[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
