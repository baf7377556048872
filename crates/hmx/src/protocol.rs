//! 📜 The line protocol spoken between `hmx create` and `hmx serve`.
//!
//! Newline-delimited, one JSON document per line, except the greeting which is a bare word:
//!
//! ```text
//!   server → client   ready                                   (or "busy", then EOF)
//!   client → server   {"loader":"Kuban/load.ini","height":..,"width":..,"range":[0,83],
//!                      "scale":100,"vertical_flip":"none","sample_at_cell_center":false}
//!   server → client   {"samples":[12,13,...]}                 (zero or more, flushed each)
//!   server → client   {"response":"DONE"}                     (or {"response":"FAIL","msg":".."})
//! ```

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::common::Sample;
use crate::partitions::{GridGeometry, VerticalFlip};

/// 👋 First line on every connection. Admission control in one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    Ready,
    Busy,
}

impl Greeting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Greeting::Ready => "ready",
            Greeting::Busy => "busy",
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        match line.trim() {
            "ready" => Ok(Greeting::Ready),
            "busy" => Ok(Greeting::Busy),
            other => bail!("💀 Expected a 'ready' or 'busy' greeting, got '{other}'."),
        }
    }
}

/// 🗺️ "Sample these points of this map for me."
///
/// The grid conventions are optional so a bare four-field request stays valid; a peer
/// fills in its own configured values for whatever is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub loader: String,
    pub height: u64,
    pub width: u64,
    /// Inclusive `[start, end]` point indices.
    pub range: (u64, u64),
    /// 📏 Metres per cell on the client's grid. Indices mean nothing without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_flip: Option<VerticalFlip>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_at_cell_center: Option<bool>,
}

impl QueryRequest {
    /// 🧾 A request that pins every grid convention to the client's geometry.
    pub fn for_geometry(loader: impl Into<String>, geometry: &GridGeometry, range: (u64, u64)) -> Self {
        Self {
            loader: loader.into(),
            height: geometry.height,
            width: geometry.width,
            range,
            scale: Some(geometry.scale),
            vertical_flip: Some(geometry.flip),
            sample_at_cell_center: Some(geometry.cell_center),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseCode {
    Done,
    Fail,
}

/// 📨 Anything the server sends after the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamLine {
    Progress {
        samples: Vec<Sample>,
    },
    Terminal {
        response: ResponseCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
}

impl StreamLine {
    pub fn done() -> Self {
        StreamLine::Terminal {
            response: ResponseCode::Done,
            msg: None,
        }
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        StreamLine::Terminal {
            response: ResponseCode::Fail,
            msg: Some(msg.into()),
        }
    }
}

/// 🧵 Serialize one message as a protocol line, trailing newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
