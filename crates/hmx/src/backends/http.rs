//! 📡 HTTP transport: talks to a game server through its REST bridge.
//!
//! The dance, in HTTP:
//!
//! ```text
//!   probe    GET    {url}
//!   upload   POST   {url}/missions/{dir}                (multipart, field "mission")
//!   trigger  POST   {url}/missions/{dir}/{file}/load
//!            POST   {url}/missions/current/begin
//!   fetch    GET    {url}/radar/stationary-objects       → [{"pos":{"z":..}}, ...]
//!   cleanup  POST   {url}/missions/current/unload
//!            DELETE {url}/missions/{dir}/{file}
//! ```
//!
//! 🧠 One reqwest client per transport, one transport per session, one session per
//! backend. The connection pool is reused across partitions.

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backends::{SessionError, SessionStep, Transport};
use crate::missions::{Job, JobTemplate};

#[derive(Debug, Deserialize, Clone)]
pub struct HttpBackendConfig {
    /// 📡 Root of the server bridge, e.g. `http://10.0.0.7:8000`.
    pub url: String,
    /// 📁 Where uploaded missions live on the server.
    #[serde(default = "default_missions_dir")]
    pub missions_dir: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// ⏳ Loading a mission can take a while on a big map. Be patient.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_missions_dir() -> String {
    "heightmap".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// 🛰️ One radar contact. We only care how high it sits.
#[derive(Debug, Deserialize)]
struct StationaryObject {
    pos: Position,
}

#[derive(Debug, Deserialize)]
struct Position {
    z: f64,
}

#[derive(Debug)]
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    config: HttpBackendConfig,
    base: String,
}

impl HttpTransport {
    pub(crate) fn new(config: HttpBackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. We asked reqwest nicely, it said no. Probably TLS. It's always TLS.")?;
        let base = config.url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            config,
            base,
        })
    }

    pub(crate) fn address(&self) -> &str {
        &self.config.url
    }

    fn mission_url(&self, job: &Job) -> String {
        format!("{}/missions/{}/{}", self.base, self.config.missions_dir, job.file_name)
    }

    /// 📮 Send a request, sort the wreckage into the right [`SessionError`] bucket.
    async fn call(
        &self,
        step: SessionStep,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, SessionError> {
        let response = request.send().await.map_err(|err| classify(step, err))?;
        let status = response.status();
        trace!("📡 {} on {} → {}", step, self.config.url, status);
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::CONFLICT {
            return Err(SessionError::Busy);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::execution(
                step,
                anyhow!("{} answered {}: {}", self.config.url, status, body),
            ));
        }
        Ok(response)
    }
}

/// 🪦 Couldn't reach the host at all → the backend is gone. Anything else → this step failed.
fn classify(step: SessionStep, err: reqwest::Error) -> SessionError {
    if err.is_connect() {
        SessionError::connection(err)
    } else {
        SessionError::execution(step, err)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<(), SessionError> {
        self.call(SessionStep::Probe, self.client.get(&self.base)).await?;
        debug!("📡 {} is answering", self.config.url);
        Ok(())
    }

    async fn send_job(&mut self, job: &Job, _template: &JobTemplate) -> Result<(), SessionError> {
        let part = Part::text(job.document.clone())
            .file_name(job.file_name.clone())
            .mime_str("text/plain")
            .map_err(|err| SessionError::execution(SessionStep::Upload, err))?;
        let form = Form::new().part("mission", part);
        let url = format!("{}/missions/{}", self.base, self.config.missions_dir);
        self.call(SessionStep::Upload, self.client.post(url).multipart(form))
            .await?;
        Ok(())
    }

    async fn trigger(&mut self, job: &Job) -> Result<(), SessionError> {
        let load = format!("{}/load", self.mission_url(job));
        self.call(SessionStep::Trigger, self.client.post(load)).await?;
        let begin = format!("{}/missions/current/begin", self.base);
        self.call(SessionStep::Trigger, self.client.post(begin)).await?;
        Ok(())
    }

    async fn stream_results(&mut self, job: &Job) -> Result<Vec<f64>, SessionError> {
        let url = format!("{}/radar/stationary-objects", self.base);
        let response = self.call(SessionStep::Fetch, self.client.get(url)).await?;
        let body = response
            .text()
            .await
            .map_err(|err| classify(SessionStep::Fetch, err))?;
        let objects: Vec<StationaryObject> = serde_json::from_str(&body)
            .with_context(|| format!("radar answer for '{}' is not a list of positions", job.file_name))
            .map_err(|err| SessionError::execution(SessionStep::Decode, err))?;
        Ok(objects.into_iter().map(|object| object.pos.z).collect())
    }

    async fn cleanup(&mut self, job: &Job) -> Result<(), SessionError> {
        let unload = format!("{}/missions/current/unload", self.base);
        self.call(SessionStep::Cleanup, self.client.post(unload)).await?;
        self.call(SessionStep::Cleanup, self.client.delete(self.mission_url(job)))
            .await?;
        Ok(())
    }
}
