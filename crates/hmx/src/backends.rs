//! 🔌 Backends: where the real I/O happens.
//!
//! 🎮 A backend is a game server that can answer height queries, but only through
//! the world's slowest side-channel: upload a mission, load it, begin it, ask the
//! radar where everything landed, unload, delete. Every. Single. Time.
//!
//! 🎭 This module is the casting agency. Need to talk HTTP to a server bridge? Speak the
//! line-delimited JSON dialect to a peer `hmx serve`? Fake the whole thing in RAM for tests?
//! We've got a [`Transport`] for that. The [`BackendSession`] on top drives any of them
//! through the same upload → trigger → fetch → cleanup dance and never asks which one it got.
//!
//! 🦆 The duck is here because every file must have one. This is law. Do not question the duck.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::app_config::BackendConfig;
use crate::missions::{Job, JobTemplate};

pub(crate) mod http;
pub(crate) mod in_mem;
pub(crate) mod line_protocol;
pub(crate) mod session;

pub use http::HttpBackendConfig;
pub use in_mem::InMemoryBackendConfig;
pub use line_protocol::LineProtocolBackendConfig;
pub(crate) use session::BackendSession;

/// 🪜 The steps of one job, for error messages that say *where* it went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    Probe,
    Upload,
    Trigger,
    Fetch,
    Cleanup,
    Decode,
}

impl fmt::Display for SessionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStep::Probe => "probe",
            SessionStep::Upload => "upload",
            SessionStep::Trigger => "trigger",
            SessionStep::Fetch => "fetch",
            SessionStep::Cleanup => "cleanup",
            SessionStep::Decode => "decode",
        };
        f.write_str(name)
    }
}

/// 💀 The three ways a backend can let us down. They are NOT equally bad.
///
/// - `Connection`: the backend is gone (refused, reset, vanished mid-stream). Its worker retires.
/// - `Busy`: somebody else holds the backend. Admission control, not a crime.
/// - `Execution`: one step failed but the backend is still there. That partition becomes a gap.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0:#}")]
    Connection(anyhow::Error),
    #[error("backend is busy")]
    Busy,
    #[error("{step} failed: {cause:#}")]
    Execution { step: SessionStep, cause: anyhow::Error },
}

impl SessionError {
    pub(crate) fn connection(cause: impl Into<anyhow::Error>) -> Self {
        SessionError::Connection(cause.into())
    }

    pub(crate) fn execution(step: SessionStep, cause: impl Into<anyhow::Error>) -> Self {
        SessionError::Execution {
            step,
            cause: cause.into(),
        }
    }

    /// 🪦 Did the backend itself go away?
    pub fn is_connection(&self) -> bool {
        matches!(self, SessionError::Connection(_))
    }
}

/// 🚚 The capability interface every wire binding implements.
///
/// # Contract 📜
/// - `connect` is a probe: can we reach this backend at all, and is it free?
/// - `send_job` → `trigger` → `stream_results` → `cleanup` run in that order, once per job.
/// - `stream_results` returns one raw height per index of the job's partition, in index order.
/// - Nothing here is reentrant. `&mut self` makes sure of it.
#[async_trait]
pub(crate) trait Transport: fmt::Debug + Send {
    async fn connect(&mut self) -> Result<(), SessionError>;
    async fn send_job(&mut self, job: &Job, template: &JobTemplate) -> Result<(), SessionError>;
    async fn trigger(&mut self, job: &Job) -> Result<(), SessionError>;
    async fn stream_results(&mut self, job: &Job) -> Result<Vec<f64>, SessionError>;
    async fn cleanup(&mut self, job: &Job) -> Result<(), SessionError>;
}

/// 🎭 The many faces of a Transport, dispatched statically so the session never knows
/// (or cares) which wire it is talking over.
#[derive(Debug)]
pub(crate) enum TransportBackend {
    Http(http::HttpTransport),
    LineProtocol(line_protocol::LineProtocolTransport),
    InMemory(in_mem::InMemoryTransport),
}

impl TransportBackend {
    /// 🏗️ Build the transport a config entry describes. No network traffic happens here.
    pub(crate) fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        Ok(match config {
            BackendConfig::Http(http_config) => {
                TransportBackend::Http(http::HttpTransport::new(http_config.clone())?)
            }
            BackendConfig::LineProtocol(line_config) => {
                TransportBackend::LineProtocol(line_protocol::LineProtocolTransport::new(line_config)?)
            }
            BackendConfig::InMemory(mem_config) => {
                TransportBackend::InMemory(in_mem::InMemoryTransport::new(mem_config.clone()))
            }
        })
    }

    /// 🏷️ Something a human can recognise in a log line.
    pub(crate) fn address(&self) -> String {
        match self {
            TransportBackend::Http(t) => t.address().to_string(),
            TransportBackend::LineProtocol(t) => t.address(),
            TransportBackend::InMemory(t) => t.address().to_string(),
        }
    }
}

#[async_trait]
impl Transport for TransportBackend {
    async fn connect(&mut self) -> Result<(), SessionError> {
        match self {
            TransportBackend::Http(t) => t.connect().await,
            TransportBackend::LineProtocol(t) => t.connect().await,
            TransportBackend::InMemory(t) => t.connect().await,
        }
    }

    async fn send_job(&mut self, job: &Job, template: &JobTemplate) -> Result<(), SessionError> {
        match self {
            TransportBackend::Http(t) => t.send_job(job, template).await,
            TransportBackend::LineProtocol(t) => t.send_job(job, template).await,
            TransportBackend::InMemory(t) => t.send_job(job, template).await,
        }
    }

    async fn trigger(&mut self, job: &Job) -> Result<(), SessionError> {
        match self {
            TransportBackend::Http(t) => t.trigger(job).await,
            TransportBackend::LineProtocol(t) => t.trigger(job).await,
            TransportBackend::InMemory(t) => t.trigger(job).await,
        }
    }

    async fn stream_results(&mut self, job: &Job) -> Result<Vec<f64>, SessionError> {
        match self {
            TransportBackend::Http(t) => t.stream_results(job).await,
            TransportBackend::LineProtocol(t) => t.stream_results(job).await,
            TransportBackend::InMemory(t) => t.stream_results(job).await,
        }
    }

    async fn cleanup(&mut self, job: &Job) -> Result<(), SessionError> {
        match self {
            TransportBackend::Http(t) => t.cleanup(job).await,
            TransportBackend::LineProtocol(t) => t.cleanup(job).await,
            TransportBackend::InMemory(t) => t.cleanup(job).await,
        }
    }
}
