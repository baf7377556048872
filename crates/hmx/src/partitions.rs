//! 🔪 Partitions: slicing a map into mission-sized pieces.
//!
//! 🎬 *[a 51 km × 51 km island sits on the cutting board. the knife is a for-loop.]*
//!
//! The grid is flattened row-major into `total` indices. We hand each backend roughly
//! `total / workers` of them, but never more than the mission object cap, because the
//! game server has Opinions about how many stationary wagons fit into one mission.
//!
//! Everything here is pure. No I/O. No clocks. Same input, same slices, every time. ✅

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::common::Partition;

/// 🔢 How many sample points a `height × width` map has at `scale` metres per cell.
/// Callers validate first; see [`checked_total_points`] for untrusted dimensions.
pub fn total_points(height: u64, width: u64, scale: u64) -> u64 {
    (height / scale) * (width / scale)
}

/// 🔢 [`total_points`] for dimensions that came from somewhere we don't trust.
/// `None` when `scale` is zero or the point count does not fit in a `u64`.
pub fn checked_total_points(height: u64, width: u64, scale: u64) -> Option<u64> {
    let rows = height.checked_div(scale)?;
    let cols = width.checked_div(scale)?;
    rows.checked_mul(cols)
}

/// 🔪 Split `[0, total - 1]` into ordered, disjoint, contiguous partitions.
///
/// `step = min(max_size, ceil(total / workers))` picks the partition count
/// (`ceil(total / step)`), then the samples are dealt out evenly: sizes differ by at most
/// one and the larger partitions come first. No partition ever exceeds `step`, so none
/// exceeds `max_size` either.
///
/// - `total == 0` → no partitions at all.
/// - `workers == 0` or `max_size == 0` → error. Somebody upstream forgot to count.
pub fn partition_points(total: u64, workers: u64, max_size: u64) -> Result<Vec<Partition>> {
    ensure!(workers > 0, "💀 Cannot partition work for zero workers. Who is going to do it, the duck?");
    ensure!(max_size > 0, "💀 A maximum partition size of zero fits exactly nothing.");

    if total == 0 {
        return Ok(Vec::new());
    }

    let step = max_size.min(total.div_ceil(workers));
    let count = total.div_ceil(step);
    let base = total / count;
    let remainder = total % count;

    let mut partitions = Vec::with_capacity(count as usize);
    let mut current = 0u64;
    for i in 0..count {
        let size = base + u64::from(i < remainder);
        partitions.push(Partition {
            start: current,
            end: current + size - 1,
        });
        current += size;
    }
    Ok(partitions)
}

/// 🧭 Which way is north? Depends on who you ask, and the backends never agreed.
///
/// - `None`: world `y` grows with the row index, as computed.
/// - `FromHeight`: world `y` is measured down from the top edge (`height - y`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalFlip {
    #[default]
    None,
    FromHeight,
}

/// 📐 How flat indices turn into world coordinates for one map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridGeometry {
    pub height: u64,
    pub width: u64,
    pub scale: u64,
    pub flip: VerticalFlip,
    pub cell_center: bool,
}

impl GridGeometry {
    /// 📍 World position of flat index `idx`:
    /// `x = (idx * scale) mod width`, `y = ((idx * scale) div width) * scale`,
    /// then the optional half-cell nudge, then the optional flip.
    ///
    /// Computed as column and row of the index so nothing is multiplied past the map
    /// edge: for `idx < total_points` both coordinates stay below `width` and `height`.
    pub fn index_to_point(&self, idx: u64) -> (u64, u64) {
        let scale = self.scale.max(1);
        let cols = (self.width / scale).max(1);
        let mut x = (idx % cols) * scale;
        let mut y = (idx / cols) * scale;
        if self.cell_center {
            let half = self.scale / 2;
            x += half;
            y += half;
        }
        let y = match self.flip {
            VerticalFlip::None => y,
            VerticalFlip::FromHeight => self.height.saturating_sub(y),
        };
        (x, y)
    }
}
