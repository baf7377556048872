//! 🔌 Line-protocol transport: drives a peer `hmx serve` over plain TCP.
//!
//! One TCP connection per partition (the startup probe's connection is kept for the
//! first one). The peer does the whole upload/trigger/fetch/cleanup
//! dance on its own engine; from here it looks like: greeting, one request line, a stream
//! of sample lines, one terminal line. See [`crate::protocol`] for the wire format.

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::backends::{SessionError, SessionStep, Transport};
use crate::missions::{Job, JobTemplate};
use crate::protocol::{Greeting, QueryRequest, ResponseCode, StreamLine, encode_line};

#[derive(Debug, Deserialize, Clone)]
pub struct LineProtocolBackendConfig {
    /// 📡 `host:port`, or just `port` for localhost.
    pub address: String,
    /// 🚧 Longest line we accept from the peer. A progress line for a 1000-point chunk
    /// is a few KiB; anything near this limit is a peer that forgot its newlines.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_max_line_bytes() -> usize {
    4 * 1024 * 1024
}

impl LineProtocolBackendConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// 🏷️ `"20001"` → `"127.0.0.1:20001"`; `"10.0.0.7:20001"` stays as it is.
pub(crate) fn parse_address(address: &str) -> anyhow::Result<String> {
    let address = address.trim();
    if let Ok(port) = address.parse::<u16>() {
        return Ok(format!("127.0.0.1:{port}"));
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(address.to_string()),
        _ => bail!("💀 '{address}' is neither a port nor a host:port pair."),
    }
}

#[derive(Debug)]
pub(crate) struct LineProtocolTransport {
    address: String,
    max_line_bytes: usize,
    stream: Option<BufReader<TcpStream>>,
}

impl LineProtocolTransport {
    pub(crate) fn new(config: &LineProtocolBackendConfig) -> anyhow::Result<Self> {
        Ok(Self {
            address: parse_address(&config.address)?,
            max_line_bytes: config.max_line_bytes.max(1),
            stream: None,
        })
    }

    pub(crate) fn address(&self) -> String {
        self.address.clone()
    }

    /// 👋 Dial, then wait for the greeting. Only a `ready` peer gets to keep the connection.
    async fn open(&self) -> Result<BufReader<TcpStream>, SessionError> {
        let socket = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("connecting to {}", self.address))
            .map_err(SessionError::connection)?;
        let mut stream = BufReader::new(socket);
        let line = read_line(&mut stream, &self.address, self.max_line_bytes).await?;
        let greeting = Greeting::parse(&line).map_err(|err| SessionError::execution(SessionStep::Probe, err))?;
        trace!("👋 {} says {}", self.address, greeting.as_str());
        match greeting {
            Greeting::Ready => Ok(stream),
            Greeting::Busy => Err(SessionError::Busy),
        }
    }
}

/// 📖 One line of at most `limit` bytes.
///
/// A peer that hangs up, even halfway through a line, is a connection error. A line that
/// runs past `limit` is a decode error: the peer is alive but talking nonsense.
async fn read_line(stream: &mut BufReader<TcpStream>, address: &str, limit: usize) -> Result<String, SessionError> {
    let mut line = Vec::new();
    let read = (&mut *stream)
        .take(limit as u64 + 1)
        .read_until(b'\n', &mut line)
        .await
        .with_context(|| format!("reading from {address}"))
        .map_err(SessionError::connection)?;
    if read == 0 {
        return Err(SessionError::connection(anyhow!("{address} closed the connection")));
    }
    if line.last() != Some(&b'\n') {
        if line.len() > limit {
            return Err(SessionError::execution(
                SessionStep::Decode,
                anyhow!("{address} sent a line longer than {limit} bytes"),
            ));
        }
        return Err(SessionError::connection(anyhow!("{address} hung up mid-line")));
    }
    String::from_utf8(line)
        .with_context(|| format!("{address} sent a line that is not UTF-8"))
        .map_err(|err| SessionError::execution(SessionStep::Decode, err))
}

#[async_trait]
impl Transport for LineProtocolTransport {
    async fn connect(&mut self) -> Result<(), SessionError> {
        // -- the probe connection holds the peer's gate, so it carries the first job too
        self.stream = Some(self.open().await?);
        Ok(())
    }

    async fn send_job(&mut self, job: &Job, template: &JobTemplate) -> Result<(), SessionError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.open().await?,
        };
        let request = QueryRequest::for_geometry(
            template.loader.clone(),
            &template.geometry,
            (job.partition.start, job.partition.end),
        );
        let line = encode_line(&request).map_err(|err| SessionError::execution(SessionStep::Upload, err))?;
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("sending request to {}", self.address))
            .map_err(SessionError::connection)?;
        debug!("📨 asked {} for {}", self.address, job.partition);
        self.stream = Some(stream);
        Ok(())
    }

    async fn trigger(&mut self, _job: &Job) -> Result<(), SessionError> {
        // -- the peer starts on its own as soon as the request line lands
        Ok(())
    }

    async fn stream_results(&mut self, job: &Job) -> Result<Vec<f64>, SessionError> {
        let mut stream = self.stream.take().ok_or_else(|| {
            SessionError::execution(SessionStep::Fetch, anyhow!("no request in flight for '{}'", job.file_name))
        })?;
        let mut heights = Vec::with_capacity(job.partition.len() as usize);
        loop {
            let line = read_line(&mut stream, &self.address, self.max_line_bytes).await?;
            let message: StreamLine = serde_json::from_str(&line)
                .with_context(|| format!("unreadable line from {}", self.address))
                .map_err(|err| SessionError::execution(SessionStep::Decode, err))?;
            match message {
                StreamLine::Progress { samples } => {
                    trace!("📦 {} samples from {}", samples.len(), self.address);
                    heights.extend(samples.into_iter().map(f64::from));
                }
                StreamLine::Terminal {
                    response: ResponseCode::Done,
                    ..
                } => return Ok(heights),
                StreamLine::Terminal {
                    response: ResponseCode::Fail,
                    msg,
                } => {
                    return Err(SessionError::execution(
                        SessionStep::Fetch,
                        anyhow!(
                            "{} reported FAIL: {}",
                            self.address,
                            msg.unwrap_or_else(|| "no reason given".to_string())
                        ),
                    ));
                }
            }
        }
    }

    async fn cleanup(&mut self, _job: &Job) -> Result<(), SessionError> {
        self.stream = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Partition;
    use crate::partitions::{GridGeometry, VerticalFlip};
    use tokio::net::TcpListener;

    #[test]
    fn the_one_where_a_bare_port_means_localhost() -> anyhow::Result<()> {
        assert_eq!(parse_address("20001")?, "127.0.0.1:20001");
        assert_eq!(parse_address("10.0.0.7:20001")?, "10.0.0.7:20001");
        assert!(parse_address("nope").is_err());
        assert!(parse_address(":20001").is_err());
        Ok(())
    }

    /// 🎭 A scripted peer: sends `script` line by line after reading one request line.
    async fn scripted_peer(script: &'static [&'static str]) -> anyhow::Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        tokio::spawn(async move {
            let Ok((socket, _)) = listener.accept().await else { return };
            let mut socket = BufReader::new(socket);
            let _ = socket.get_mut().write_all(script[0].as_bytes()).await;
            let mut request = String::new();
            let _ = socket.read_line(&mut request).await;
            for line in &script[1..] {
                let _ = socket.get_mut().write_all(line.as_bytes()).await;
            }
        });
        Ok(address)
    }

    fn template() -> JobTemplate {
        JobTemplate::new(
            "Kuban/load.ini",
            GridGeometry {
                height: 1000,
                width: 1000,
                scale: 100,
                flip: VerticalFlip::None,
                cell_center: false,
            },
        )
    }

    async fn run_one(address: String) -> Result<Vec<f64>, SessionError> {
        run_one_limited(address, 1024).await
    }

    async fn run_one_limited(address: String, max_line_bytes: usize) -> Result<Vec<f64>, SessionError> {
        let template = template();
        let job = template.build(Partition { start: 0, end: 2 });
        let mut transport = LineProtocolTransport {
            address,
            max_line_bytes,
            stream: None,
        };
        transport.send_job(&job, &template).await?;
        transport.trigger(&job).await?;
        transport.stream_results(&job).await
    }

    #[tokio::test]
    async fn the_one_where_samples_arrive_in_several_lines() -> anyhow::Result<()> {
        let address = scripted_peer(&[
            "ready\n",
            "{\"samples\":[5,6]}\n",
            "{\"samples\":[7]}\n",
            "{\"response\":\"DONE\"}\n",
        ])
        .await?;
        assert_eq!(run_one(address).await?, vec![5.0, 6.0, 7.0]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_peer_is_busy() -> anyhow::Result<()> {
        let address = scripted_peer(&["busy\n"]).await?;
        assert!(matches!(run_one(address).await, Err(SessionError::Busy)));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_fail_keeps_the_backend_but_loses_the_partition() -> anyhow::Result<()> {
        let address = scripted_peer(&["ready\n", "{\"response\":\"FAIL\",\"msg\":\"engine sad\"}\n"]).await?;
        let err = run_one(address).await.expect_err("FAIL is a failure");
        assert!(matches!(err, SessionError::Execution { step: SessionStep::Fetch, .. }));
        assert!(err.to_string().contains("engine sad"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_peer_hangs_up_mid_stream() -> anyhow::Result<()> {
        let address = scripted_peer(&["ready\n", "{\"samples\":[5]}\n"]).await?;
        let err = run_one(address).await.expect_err("no terminal line, no result");
        assert!(err.is_connection());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_line_without_end_is_cut_off() -> anyhow::Result<()> {
        let address = scripted_peer(&["ready\n", "{\"samples\":[5,5,5,5,5,5,5,5,5,5,5,5,5,5,5,5,5,5,5,5]}\n"]).await?;
        let err = run_one_limited(address, 32).await.expect_err("the progress line is over 32 bytes");
        assert!(matches!(err, SessionError::Execution { step: SessionStep::Decode, .. }));
        assert!(err.to_string().contains("longer than 32 bytes"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_request_carries_the_grid_conventions() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let peer = tokio::spawn(async move {
            let (socket, _) = listener.accept().await?;
            let mut socket = BufReader::new(socket);
            socket.get_mut().write_all(b"ready\n").await?;
            let mut request = String::new();
            socket.read_line(&mut request).await?;
            socket.get_mut().write_all(b"{\"response\":\"DONE\"}\n").await?;
            anyhow::Ok(serde_json::from_str::<QueryRequest>(&request)?)
        });

        // -- DONE with no samples is a short answer; only the request matters here
        let _ = run_one(address).await;
        let request = peer.await??;
        assert_eq!(request.range, (0, 2));
        assert_eq!(request.scale, Some(100));
        assert_eq!(request.vertical_flip, Some(VerticalFlip::None));
        assert_eq!(request.sample_at_cell_center, Some(false));
        Ok(())
    }
}
