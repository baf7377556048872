//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! Two top-level shapes live here:
//! - [`AppConfig`]: one pipeline run (`hmx create`). Which map, which servers, where the bytes go.
//! - [`ServeConfig`]: the accepting server (`hmx serve`). Where to listen, which engine to drive.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::backends::{HttpBackendConfig, InMemoryBackendConfig, LineProtocolBackendConfig};
use crate::common::SAMPLE_WIDTH;
use crate::partitions::{GridGeometry, VerticalFlip, checked_total_points, total_points};
use crate::sinks::FileSinkConfig;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 🗺️ Which map, how big, how finely sampled.
    pub grid: GridConfig,
    /// 📡 The servers that will do the actual sampling. Order doesn't matter. Count does.
    pub backends: Vec<BackendConfig>,
    /// 💾 Where the finished heightmap lands.
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🗺️ The map being sampled, and the coordinate conventions to sample it with.
#[derive(Debug, Deserialize, Clone)]
pub struct GridConfig {
    /// 📜 Map loader path as the game knows it, e.g. `Hawaii/load.ini`.
    pub loader: String,
    /// 📏 Map height in metres. Must be divisible by `scale`.
    pub height: u64,
    /// 📏 Map width in metres. Must be divisible by `scale`.
    pub width: u64,
    /// 📏 Metres per grid cell.
    #[serde(default = "default_scale")]
    pub scale: u64,
    #[serde(default)]
    pub vertical_flip: VerticalFlip,
    /// 🎯 Sample the middle of each cell instead of its corner.
    #[serde(default)]
    pub sample_at_cell_center: bool,
    /// 📄 Optional mission header template; `{loader}` gets substituted.
    #[serde(default)]
    pub mission_template_file: Option<PathBuf>,
}

// 📏 100 m per cell. The game's own map tiles agree, and arguing with the game never works.
fn default_scale() -> u64 {
    100
}

impl GridConfig {
    /// ✅ Catch nonsense before a single socket is opened.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.loader.trim().is_empty(), "💀 Map loader is not specified.");
        ensure!(self.scale > 0, "💀 Grid scale must be positive. Zero metres per cell is a black hole.");
        ensure!(
            self.height % self.scale == 0,
            "💀 Map height {} is not proportional to {}.",
            self.height,
            self.scale
        );
        ensure!(
            self.width % self.scale == 0,
            "💀 Map width {} is not proportional to {}.",
            self.width,
            self.scale
        );
        let fits = checked_total_points(self.height, self.width, self.scale)
            .and_then(|points| points.checked_mul(SAMPLE_WIDTH as u64))
            .is_some();
        ensure!(
            fits,
            "💀 A {}×{} m map at {} m per cell has more points than a u64 can count.",
            self.height,
            self.width,
            self.scale
        );
        Ok(())
    }

    /// 🔢 Total sample points: `(height / scale) × (width / scale)`.
    pub fn total_points(&self) -> u64 {
        total_points(self.height, self.width, self.scale)
    }

    /// 🏷️ `Hawaii/load.ini` → `Hawaii`.
    pub fn map_name(&self) -> &str {
        self.loader.split('/').next().unwrap_or(&self.loader)
    }

    pub fn geometry(&self) -> GridGeometry {
        GridGeometry {
            height: self.height,
            width: self.width,
            scale: self.scale,
            flip: self.vertical_flip,
            cell_center: self.sample_at_cell_center,
        }
    }
}

/// 🎭 The many faces of a backend: HTTP bridge, line-protocol peer, or the in-memory stunt double.
#[derive(Debug, Deserialize, Clone)]
pub enum BackendConfig {
    Http(HttpBackendConfig),
    LineProtocol(LineProtocolBackendConfig),
    InMemory(InMemoryBackendConfig),
}

impl BackendConfig {
    /// 🏷️ What to call this backend in logs before a session exists for it.
    pub fn label(&self) -> String {
        match self {
            BackendConfig::Http(config) => config.url.clone(),
            BackendConfig::LineProtocol(config) => config.address.clone(),
            BackendConfig::InMemory(config) => config.name.clone(),
        }
    }
}

/// 💾 Where the heightmap bytes go.
#[derive(Debug, Deserialize, Clone)]
pub enum OutputConfig {
    File(FileSinkConfig),
    /// 🧠 Keep everything in RAM. For tests and for people who trust their swap file.
    InMemory,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig::File(FileSinkConfig::default())
    }
}

/// 🎛️ Knobs for the pipeline machinery itself.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 🔪 Partition size cap: how many points one mission may carry.
    #[serde(default = "default_max_objects_in_mission", alias = "max_partition_size")]
    pub max_objects_in_mission: u64,
    /// 📬 Bound of the results queue between dispatch workers and the collector.
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
    /// 📊 Draw the progress bar. Tests turn this off; humans leave it on.
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_max_objects_in_mission() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    10
}

fn default_show_progress() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_objects_in_mission: default_max_objects_in_mission(),
            queue_capacity: default_queue_capacity(),
            show_progress: default_show_progress(),
        }
    }
}

/// 🛎️ Configuration for `hmx serve`: this process becomes a backend for somebody else.
#[derive(Debug, Deserialize, Clone)]
pub struct ServeConfig {
    /// 📡 `host:port` to accept clients on. Port 0 lets the OS pick.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 🎮 The engine this server drives to answer queries (usually the game's HTTP bridge).
    pub engine: BackendConfig,
    #[serde(default = "default_scale")]
    pub scale: u64,
    #[serde(default)]
    pub vertical_flip: VerticalFlip,
    #[serde(default)]
    pub sample_at_cell_center: bool,
    #[serde(default = "default_max_objects_in_mission")]
    pub max_objects_in_mission: u64,
    #[serde(default)]
    pub mission_template_file: Option<PathBuf>,
    /// 🚧 Request lines longer than this are refused. Nobody needs a 1 GB JSON request.
    #[serde(default = "default_max_request_line_bytes")]
    pub max_request_line_bytes: usize,
    /// ⏳ How long an admitted client may sit silent before it loses its seat.
    #[serde(default = "default_request_idle_timeout_ms")]
    pub request_idle_timeout_ms: u64,
}

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

fn default_max_request_line_bytes() -> usize {
    16 * 1024
}

fn default_request_idle_timeout_ms() -> u64 {
    30_000
}

/// 🚀 Load the run config: `HMX_*` env vars as the base layer, the TOML file on top.
pub fn load_config(config_file_name: Option<&Path>) -> Result<AppConfig> {
    let config: AppConfig = extract(config_file_name)?;
    config
        .grid
        .validate()
        .context("💀 The grid section parsed, but it describes a map that cannot be sampled.")?;
    ensure!(
        config.runtime.max_objects_in_mission > 0,
        "💀 runtime.max_objects_in_mission must be at least 1."
    );
    ensure!(config.runtime.queue_capacity > 0, "💀 runtime.queue_capacity must be at least 1.");
    Ok(config)
}

/// 🚀 Load the server config, same layering as [`load_config`].
pub fn load_serve_config(config_file_name: Option<&Path>) -> Result<ServeConfig> {
    let config: ServeConfig = extract(config_file_name)?;
    ensure!(config.scale > 0, "💀 scale must be positive.");
    ensure!(config.max_objects_in_mission > 0, "💀 max_objects_in_mission must be at least 1.");
    Ok(config)
}

fn extract<T: DeserializeOwned>(config_file_name: Option<&Path>) -> Result<T> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    // 🏗️ env first, file second: the file wins on conflicts
    let config = Figment::new().merge(Env::prefixed("HMX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (HMX_*). \
             The file exists in our hearts, but apparently not in a shape serde recognises.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (HMX_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}
