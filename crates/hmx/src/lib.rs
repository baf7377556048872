//! 🗺️ hmx: heightmaps for flight-sim maps, sampled one stationary wagon at a time.
//!
//! The map is cut into contiguous partitions of point indices. Each reachable game server
//! gets a dispatch worker that runs partitions through the upload → trigger → fetch →
//! cleanup dance, and a single collector writes every result at its own byte offset. The
//! output is a flat file of little-endian `u16` heights, row-major.

pub mod app_config;
pub mod common;
pub mod missions;
pub mod partitions;
pub mod protocol;
pub mod render;
pub mod server;

mod backends;
mod progress;
mod sinks;
mod supervisors;

use anyhow::Result;

use crate::app_config::AppConfig;
use crate::supervisors::Supervisor;

pub use backends::{
    HttpBackendConfig, InMemoryBackendConfig, LineProtocolBackendConfig, SessionError, SessionStep,
};
pub use sinks::{FileSinkConfig, RunOutput};
pub use supervisors::{FailedPartition, RunSummary, UnreachableBackend};

/// 🚀 One full heightmap run, end to end.
pub async fn run(app_config: AppConfig) -> Result<RunSummary> {
    Supervisor::new(app_config).run().await
}
