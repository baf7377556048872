//! 📦 Common data structures: the building blocks of hmx.
//!
//! 🗺️ A map is a grid. A grid is a line, if you squint hard enough (row-major, no cap).
//! This module holds the humble types that ferry slices of that line from the
//! partitioner, through the backends, and into the output file at the right offset.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 📏 One height sample, in metres, as the game reports it. Unsigned, because
/// apparently nothing in this world is below sea level. (The ocean disagrees. The format doesn't.)
pub type Sample = u16;

/// 📏 Width of one packed [`Sample`] in bytes. The output file is exactly
/// `total_points × SAMPLE_WIDTH` bytes, no header, little-endian.
pub const SAMPLE_WIDTH: usize = std::mem::size_of::<Sample>();

/// 🍰 A contiguous, inclusive range of flat grid indices (`index = y * cols + x`).
///
/// Created once by the partitioner, never mutated afterwards. It rides the work queue
/// to a dispatch worker, rides the results queue to the collector, and is then forgotten.
/// Like a boarding pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// 🚩 first index, inclusive
    pub start: u64,
    /// 🏁 last index, inclusive
    pub end: u64,
}

impl Partition {
    /// 🏗️ Build a partition. `start > end` is nonsense and we say so.
    pub fn new(start: u64, end: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(
            start <= end,
            "💀 A partition that starts at {start} and ends at {end} is a time machine, not a range."
        );
        Ok(Self { start, end })
    }

    /// 🔢 Number of samples covered. Never zero.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// 📏 How many output bytes this partition occupies.
    pub fn byte_len(&self) -> usize {
        self.len() as usize * SAMPLE_WIDTH
    }

    /// 📍 Where this partition's bytes start in the output.
    pub fn byte_offset(&self) -> u64 {
        self.start * SAMPLE_WIDTH as u64
    }

    /// 🔄 The flat indices in this partition, ascending.
    pub fn indices(&self) -> std::ops::RangeInclusive<u64> {
        self.start..=self.end
    }

    /// 🔪 Split into consecutive sub-ranges of at most `max_len` samples.
    /// Used by the server to break one big client request into mission-sized bites.
    pub fn chunks(self, max_len: u64) -> impl Iterator<Item = Partition> {
        let step = max_len.max(1);
        let end = self.end;
        let mut next = Some(self.start);
        std::iter::from_fn(move || {
            let start = next?;
            let chunk_end = start.saturating_add(step - 1).min(end);
            next = if chunk_end == end { None } else { Some(chunk_end + 1) };
            Some(Partition { start, end: chunk_end })
        })
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.start, self.end)
    }
}

/// 📬 What a dispatch worker hands to the collector: where the bytes go, and the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartitionResult {
    pub partition: Partition,
    pub bytes: Vec<u8>,
}

/// 🗜️ Clamp one raw height into a [`Sample`]. Saturating, so −3.2 m of Dutch polder becomes 0
/// and a NaN becomes 0 too (`as` casts from float saturate in Rust, NaN included).
pub fn to_sample(height: f64) -> Sample {
    height as Sample
}

/// 🗜️ Pack samples into the little-endian on-disk format, back to back.
pub fn pack_samples(samples: &[Sample]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// 📖 The inverse of [`pack_samples`]. A trailing odd byte is ignored.
pub fn unpack_samples(bytes: &[u8]) -> Vec<Sample> {
    bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|pair| Sample::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
