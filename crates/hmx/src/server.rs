//! 🛎️ The accepting server (`hmx serve`), where this process becomes a backend itself.
//!
//! One client at a time, enforced by a READY/BUSY [`ServerGate`]. A second client gets
//! `busy` and a closed socket, no queueing. The client that gets in sends one request
//! line; we run the requested range on our own engine session in
//! `max_objects_in_mission`-sized chunks and stream each chunk back as soon as it lands.
//!
//! Whatever happens to the connection (finished, failed, client vanished) the gate
//! guard drops and the server is READY again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::app_config::{GridConfig, ServeConfig};
use crate::backends::BackendSession;
use crate::common::Partition;
use crate::missions::{JobTemplate, read_header};
use crate::protocol::{Greeting, QueryRequest, StreamLine, encode_line};

mod gate;

pub use gate::{GateGuard, GateState, ServerGate};

struct ServerState {
    gate: ServerGate,
    engine: Mutex<BackendSession>,
    config: ServeConfig,
    header: Option<Arc<str>>,
}

impl ServerState {
    /// 🧾 Turn a request into a job template plus the partition it covers, or say why not.
    ///
    /// The client's flip and cell-centre choices win over ours; they only move where a
    /// wagon is placed. Scale is different: our engine session is set up for our scale,
    /// so a client on another grid is refused rather than silently sampled wrong.
    fn prepare(&self, request: &QueryRequest) -> Result<(JobTemplate, Partition)> {
        if let Some(scale) = request.scale {
            ensure!(
                scale == self.config.scale,
                "scale mismatch: the request uses {scale} m per cell, this server samples at {} m",
                self.config.scale
            );
        }
        let grid = GridConfig {
            loader: request.loader.clone(),
            height: request.height,
            width: request.width,
            scale: self.config.scale,
            vertical_flip: request.vertical_flip.unwrap_or(self.config.vertical_flip),
            sample_at_cell_center: request.sample_at_cell_center.unwrap_or(self.config.sample_at_cell_center),
            mission_template_file: None,
        };
        grid.validate()?;
        let (start, end) = request.range;
        let partition = Partition::new(start, end)?;
        let total = grid.total_points();
        ensure!(end < total, "range end {end} is outside the {total}-point grid");

        let template = JobTemplate::new(grid.loader.clone(), grid.geometry());
        let template = match &self.header {
            Some(header) => template.with_header(header.clone()),
            None => template,
        };
        Ok((template, partition))
    }
}

/// 🛎️ A bound, not-yet-running server. Split from [`HeightServer::run`] so callers can
/// learn the port before the accept loop starts.
pub struct HeightServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl HeightServer {
    pub async fn bind(config: ServeConfig) -> Result<Self> {
        let mut engine = BackendSession::from_config(&config.engine)?;
        if let Err(err) = engine.connect().await {
            // -- the engine may come up later; each request will find out for itself
            warn!("🎮 engine {} is not answering yet: {}", engine.address(), err);
        }
        let header = match &config.mission_template_file {
            Some(path) => Some(Arc::from(read_header(path)?)),
            None => None,
        };
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("💀 Could not listen on '{}'. Port taken? Wrong host?", config.listen))?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                gate: ServerGate::default(),
                engine: Mutex::new(engine),
                config,
                header,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("💀 The listener forgot its own address")
    }

    /// 🔁 Accept forever. Each connection runs on its own task.
    pub async fn run(self) -> Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await.context("💀 accept failed")?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, peer, state).await {
                    warn!("🔌 connection from {} ended badly: {:#}", peer, err);
                }
            });
        }
    }
}

/// 🚀 `hmx serve`: bind, announce, accept forever.
pub async fn serve(config: ServeConfig) -> Result<()> {
    let server = HeightServer::bind(config).await?;
    info!("🛎️ listening on {}", server.local_addr()?);
    server.run().await
}

enum RequestLine {
    Line(Vec<u8>),
    TooLong,
    Closed,
}

/// 📖 Read one line, but never more than `limit` bytes of it.
async fn read_request_line<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> Result<RequestLine> {
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', &mut line)
        .await
        .context("reading request line")?;
    if read == 0 {
        return Ok(RequestLine::Closed);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() > limit {
        return Ok(RequestLine::TooLong);
    }
    Ok(RequestLine::Line(line))
}

async fn send_text<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<()> {
    writer.write_all(text.as_bytes()).await.context("writing to client")?;
    writer.flush().await.context("flushing to client")?;
    Ok(())
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, message: &StreamLine) -> Result<()> {
    send_text(writer, &encode_line(message)?).await
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, state: Arc<ServerState>) -> Result<()> {
    let (read_half, mut writer) = socket.into_split();

    let Some(guard) = state.gate.try_acquire() else {
        debug!("🙅 {} turned away, server is busy", peer);
        send_text(&mut writer, &format!("{}\n", Greeting::Busy.as_str())).await?;
        let _ = writer.shutdown().await;
        return Ok(());
    };
    send_text(&mut writer, &format!("{}\n", Greeting::Ready.as_str())).await?;

    let mut reader = BufReader::new(read_half);
    let Some(last_word) = serve_request(&mut reader, &mut writer, peer, &state).await? else {
        return Ok(());
    };
    // -- the seat is free before the client reads DONE/FAIL, so its next dial gets `ready`
    drop(guard);
    send_line(&mut writer, &last_word).await
}

/// 🧭 Read one request and stream its progress lines. Returns the terminal line still
/// owed to the client, or `None` when the client has already gone.
async fn serve_request<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut R,
    writer: &mut W,
    peer: SocketAddr,
    state: &ServerState,
) -> Result<Option<StreamLine>> {
    let idle_limit = Duration::from_millis(state.config.request_idle_timeout_ms);
    let request_line = timeout(idle_limit, read_request_line(reader, state.config.max_request_line_bytes)).await;
    let Ok(request_line) = request_line else {
        warn!("⏳ {} said nothing for {:?}, freeing the seat", peer, idle_limit);
        return Ok(Some(StreamLine::fail("timed out waiting for a request")));
    };
    let line = match request_line? {
        RequestLine::Line(line) => line,
        RequestLine::Closed => {
            debug!("👋 {} left without asking anything", peer);
            return Ok(None);
        }
        RequestLine::TooLong => {
            warn!("🚧 {} sent a request line over {} bytes", peer, state.config.max_request_line_bytes);
            return Ok(Some(StreamLine::fail("request line too long")));
        }
    };

    let request: QueryRequest = match serde_json::from_slice(&line) {
        Ok(request) => request,
        Err(err) => return Ok(Some(StreamLine::fail(format!("malformed request: {err}")))),
    };
    let (template, partition) = match state.prepare(&request) {
        Ok(prepared) => prepared,
        Err(err) => {
            warn!("🙅 {} sent a request this server can't honour: {:#}", peer, err);
            return Ok(Some(StreamLine::fail(format!("{err:#}"))));
        }
    };
    info!("🗺️ {} asks for {} of {}", peer, partition, request.loader);

    let mut engine = state.engine.lock().await;
    for chunk in partition.chunks(state.config.max_objects_in_mission) {
        let samples = match engine.execute_samples(chunk, &template).await {
            Ok(samples) => samples,
            Err(err) => {
                warn!("💥 {} failed on the engine: {}", chunk, err);
                return Ok(Some(StreamLine::fail(err.to_string())));
            }
        };
        if let Err(err) = send_line(writer, &StreamLine::Progress { samples }).await {
            // -- nobody to stream to; stop spending engine time on it
            debug!("👋 {} went away mid-stream: {:#}", peer, err);
            return Ok(None);
        }
    }
    debug!("✅ {} served {}", peer, partition);
    Ok(Some(StreamLine::done()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::{AppConfig, BackendConfig, OutputConfig, RuntimeConfig};
    use crate::backends::in_mem::synthetic_height;
    use crate::backends::{InMemoryBackendConfig, LineProtocolBackendConfig, SessionError};
    use crate::common::{to_sample, unpack_samples};
    use crate::partitions::VerticalFlip;
    use crate::sinks::RunOutput;
    use crate::supervisors::Supervisor;

    fn serve_config(engine: InMemoryBackendConfig, max_objects: u64) -> ServeConfig {
        ServeConfig {
            listen: "127.0.0.1:0".to_string(),
            engine: BackendConfig::InMemory(engine),
            scale: 100,
            vertical_flip: VerticalFlip::None,
            sample_at_cell_center: false,
            max_objects_in_mission: max_objects,
            mission_template_file: None,
            max_request_line_bytes: 256,
            request_idle_timeout_ms: 30_000,
        }
    }

    async fn start(config: ServeConfig) -> anyhow::Result<SocketAddr> {
        let server = HeightServer::bind(config).await?;
        let address = server.local_addr()?;
        tokio::spawn(server.run());
        Ok(address)
    }

    async fn greeting(stream: &mut BufReader<TcpStream>) -> anyhow::Result<String> {
        let mut line = String::new();
        stream.read_line(&mut line).await?;
        Ok(line)
    }

    async fn dial(address: SocketAddr) -> anyhow::Result<BufReader<TcpStream>> {
        Ok(BufReader::new(TcpStream::connect(address).await?))
    }

    #[tokio::test]
    async fn the_one_where_the_second_client_is_turned_away_then_let_in() -> anyhow::Result<()> {
        let address = start(serve_config(InMemoryBackendConfig::default(), 10)).await?;

        let mut first = dial(address).await?;
        assert_eq!(greeting(&mut first).await?, "ready\n");

        let mut second = dial(address).await?;
        assert_eq!(greeting(&mut second).await?, "busy\n");
        assert_eq!(greeting(&mut second).await?, "", "busy means closed");

        // 🧪 the first client vanishes without a word; the gate must reopen
        drop(first);
        let mut reopened = false;
        for _ in 0..50 {
            let mut third = dial(address).await?;
            if greeting(&mut third).await? == "ready\n" {
                reopened = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reopened, "gate never went back to READY");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_range_streams_back_in_chunks() -> anyhow::Result<()> {
        let address = start(serve_config(InMemoryBackendConfig::default(), 30)).await?;
        let mut client = dial(address).await?;
        assert_eq!(greeting(&mut client).await?, "ready\n");
        client
            .get_mut()
            .write_all(b"{\"loader\":\"Kuban/load.ini\",\"height\":1000,\"width\":1000,\"range\":[0,99]}\n")
            .await?;

        let mut lines = Vec::new();
        loop {
            let line = greeting(&mut client).await?;
            if line.is_empty() {
                break;
            }
            lines.push(serde_json::from_str::<StreamLine>(&line)?);
        }
        assert_eq!(lines.len(), 5, "4 chunks of at most 30, then DONE");
        assert_eq!(lines.last(), Some(&StreamLine::done()));
        let samples: usize = lines
            .iter()
            .map(|line| match line {
                StreamLine::Progress { samples } => samples.len(),
                StreamLine::Terminal { .. } => 0,
            })
            .sum();
        assert_eq!(samples, 100);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bad_requests_get_fail_not_silence() -> anyhow::Result<()> {
        let address = start(serve_config(InMemoryBackendConfig::default(), 30)).await?;
        let requests: [&[u8]; 3] = [
            b"this is not json\n",
            b"{\"loader\":\"Kuban/load.ini\",\"height\":1000,\"width\":1000,\"range\":[0,100]}\n",
            // -- exactly limit + 1 bytes, so the server reads all of it before answering
            &[b'x'; 257],
        ];
        for request in requests {
            let mut client = loop {
                let mut client = dial(address).await?;
                if greeting(&mut client).await? == "ready\n" {
                    break client;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            client.get_mut().write_all(request).await?;
            let reply: StreamLine = serde_json::from_str(&greeting(&mut client).await?)?;
            assert!(
                matches!(reply, StreamLine::Terminal { response: crate::protocol::ResponseCode::Fail, .. }),
                "expected FAIL, got {reply:?}"
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_engine_failure_reaches_the_client_as_fail() -> anyhow::Result<()> {
        let address = start(serve_config(
            InMemoryBackendConfig {
                fail_on_jobs: vec![2],
                ..InMemoryBackendConfig::default()
            },
            10,
        ))
        .await?;
        let template = JobTemplate::new(
            "Kuban/load.ini",
            crate::partitions::GridGeometry {
                height: 1000,
                width: 1000,
                scale: 100,
                flip: VerticalFlip::None,
                cell_center: false,
            },
        );
        let mut session = BackendSession::from_config(&BackendConfig::LineProtocol(LineProtocolBackendConfig::new(
            address.port().to_string(),
        )))?;
        let err = session
            .execute(Partition::new(0, 29)?, &template)
            .await
            .expect_err("second chunk fails on the engine");
        assert!(matches!(err, SessionError::Execution { .. }));

        // 🧪 the backend is still there for the next partition
        let samples = session.execute_samples(Partition::new(30, 39)?, &template).await?;
        assert_eq!(samples.len(), 10);
        Ok(())
    }

    fn kuban(height: u64, width: u64, scale: u64) -> GridConfig {
        GridConfig {
            loader: "Kuban/load.ini".to_string(),
            height,
            width,
            scale,
            vertical_flip: VerticalFlip::None,
            sample_at_cell_center: false,
            mission_template_file: None,
        }
    }

    fn create_against(grid: GridConfig, peers: &[SocketAddr]) -> AppConfig {
        AppConfig {
            grid,
            backends: peers
                .iter()
                .map(|address| BackendConfig::LineProtocol(LineProtocolBackendConfig::new(address.to_string())))
                .collect(),
            output: OutputConfig::InMemory,
            runtime: RuntimeConfig {
                max_objects_in_mission: 40,
                queue_capacity: 4,
                show_progress: false,
            },
        }
    }

    fn heights_for(grid: &GridConfig) -> Vec<u16> {
        let geometry = grid.geometry();
        (0..grid.total_points())
            .map(|idx| {
                let (x, y) = geometry.index_to_point(idx);
                to_sample(synthetic_height(x, y))
            })
            .collect()
    }

    async fn ask(address: SocketAddr, request: &[u8]) -> anyhow::Result<StreamLine> {
        let mut client = loop {
            let mut client = dial(address).await?;
            if greeting(&mut client).await? == "ready\n" {
                break client;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        client.get_mut().write_all(request).await?;
        Ok(serde_json::from_str(&greeting(&mut client).await?)?)
    }

    fn is_fail(reply: &StreamLine) -> bool {
        matches!(reply, StreamLine::Terminal { response: crate::protocol::ResponseCode::Fail, .. })
    }

    #[tokio::test]
    async fn the_one_where_create_drives_two_serve_peers_end_to_end() -> anyhow::Result<()> {
        let first = start(serve_config(InMemoryBackendConfig::default(), 7)).await?;
        let second = start(serve_config(InMemoryBackendConfig::default(), 7)).await?;
        let config = create_against(kuban(2500, 1000, 100), &[first, second]);

        let summary = Supervisor::new(config.clone()).run().await?;
        assert!(summary.is_complete());
        let RunOutput::InMemory(bytes) = &summary.output else {
            panic!("💀 expected in-memory output");
        };
        assert_eq!(unpack_samples(bytes), heights_for(&config.grid));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_client_grid_conventions_win_over_the_peers() -> anyhow::Result<()> {
        // 🧪 the peers are set up for no flip and corner sampling
        let peer = start(serve_config(InMemoryBackendConfig::default(), 7)).await?;
        let grid = GridConfig {
            vertical_flip: VerticalFlip::FromHeight,
            sample_at_cell_center: true,
            ..kuban(1200, 800, 100)
        };
        let peer_view = kuban(1200, 800, 100);
        assert_ne!(heights_for(&grid), heights_for(&peer_view), "the conventions must move the wagons");

        let summary = Supervisor::new(create_against(grid.clone(), &[peer])).run().await?;
        assert!(summary.is_complete());
        let RunOutput::InMemory(bytes) = &summary.output else {
            panic!("💀 expected in-memory output");
        };
        assert_eq!(unpack_samples(bytes), heights_for(&grid));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_peer_on_another_scale_refuses_instead_of_guessing() -> anyhow::Result<()> {
        let peer = start(serve_config(InMemoryBackendConfig::default(), 7)).await?;
        let summary = Supervisor::new(create_against(kuban(2000, 1000, 200), &[peer])).run().await?;

        assert!(!summary.is_complete());
        assert_eq!(summary.samples_written, 0);
        assert!(!summary.failed_partitions.is_empty());
        for gap in &summary.failed_partitions {
            assert!(gap.reason.contains("scale mismatch"), "unexpected reason: {}", gap.reason);
        }
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_map_too_big_to_count_gets_fail() -> anyhow::Result<()> {
        let address = start(serve_config(InMemoryBackendConfig::default(), 30)).await?;
        let reply = ask(
            address,
            b"{\"loader\":\"Kuban/load.ini\",\"height\":18446744073709551600,\"width\":18446744073709551600,\"range\":[0,1]}\n",
        )
        .await?;
        assert!(is_fail(&reply), "expected FAIL, got {reply:?}");

        // 🧪 and the server is still there for a sane request
        let reply = ask(
            address,
            b"{\"loader\":\"Kuban/load.ini\",\"height\":1000,\"width\":1000,\"range\":[0,9]}\n",
        )
        .await?;
        assert!(matches!(reply, StreamLine::Progress { ref samples } if samples.len() == 10));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_silent_client_loses_its_seat() -> anyhow::Result<()> {
        let address = start(ServeConfig {
            request_idle_timeout_ms: 50,
            ..serve_config(InMemoryBackendConfig::default(), 30)
        })
        .await?;

        let mut quiet = dial(address).await?;
        assert_eq!(greeting(&mut quiet).await?, "ready\n");
        let reply: StreamLine = serde_json::from_str(&greeting(&mut quiet).await?)?;
        assert!(is_fail(&reply), "expected FAIL, got {reply:?}");

        // 🧪 the seat is free again while the quiet client is still connected
        let mut next = dial(address).await?;
        assert_eq!(greeting(&mut next).await?, "ready\n");
        drop(quiet);
        Ok(())
    }
}
