//! 📜 Missions: the job documents we smuggle sample points through.
//!
//! The game server can't be asked "how high is the ground at (x, y)?" directly.
//! What it *can* do is load a mission, place a stationary wagon at (x, y), and then
//! tell us where the wagon ended up. Gravity does the rest. 🚂⬇️
//!
//! So a "job" is a mission file with one wagon per sample point, in partition order.
//! The backend reports wagon positions in the same order, and the `z` of each one
//! is our height sample. Hacky? Extremely. Works? Since 2014.
//!
//! Pure functions only. The transports do the I/O.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::app_config::GridConfig;
use crate::common::Partition;
use crate::partitions::GridGeometry;

/// 📄 Default mission header. `{loader}` is replaced with the map loader path.
pub const DEFAULT_MISSION_HEADER: &str = "[MAIN]
  MAP {loader}
  TIME 12.0
  CloudType 0
  CloudHeight 1000.0
  army 1
  playerNum 0
[NStationary]
";

/// 🧾 Everything needed to turn a [`Partition`] into a [`Job`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub loader: String,
    pub geometry: GridGeometry,
    header: Arc<str>,
}

/// 📦 One rendered job: the partition it covers, the name it is uploaded under, and the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub partition: Partition,
    pub file_name: String,
    pub document: String,
}

impl JobTemplate {
    pub fn new(loader: impl Into<String>, geometry: GridGeometry) -> Self {
        Self {
            loader: loader.into(),
            geometry,
            header: Arc::from(DEFAULT_MISSION_HEADER),
        }
    }

    /// 🎨 Swap the mission header for a custom one.
    pub fn with_header(mut self, header: impl Into<Arc<str>>) -> Self {
        self.header = header.into();
        self
    }

    /// 🏗️ Build the template for a configured grid, reading a custom header file if one is set.
    pub fn from_grid(grid: &GridConfig) -> Result<Self> {
        let template = Self::new(grid.loader.clone(), grid.geometry());
        match &grid.mission_template_file {
            Some(path) => Ok(template.with_header(read_header(path)?)),
            None => Ok(template),
        }
    }

    /// 🏷️ `Hawaii/load.ini` → `Hawaii`.
    pub fn map_name(&self) -> &str {
        self.loader.split('/').next().unwrap_or(&self.loader)
    }

    /// 🏷️ Per-partition file name. Partitions are disjoint, so names never collide across backends.
    pub fn file_name(&self, partition: Partition) -> String {
        format!("{}_{}_{}.mis", self.map_name(), partition.start, partition.end)
    }

    /// 📜 Render the mission document: header, then one wagon per index, in index order.
    pub fn render(&self, partition: Partition) -> String {
        let mut document = self.header.replace("{loader}", &self.loader);
        if !document.ends_with('\n') {
            document.push('\n');
        }
        document.reserve(partition.len() as usize * 64);
        for (i, idx) in partition.indices().enumerate() {
            let (x, y) = self.geometry.index_to_point(idx);
            // -- writing into a String cannot fail; the Result is a formality
            let _ = writeln!(
                document,
                "  {i}_Static vehicles.stationary.Stationary$Wagon12 2 {x}.00 {y}.00 360.00 0.0"
            );
        }
        document
    }

    /// 📦 Name + render in one go.
    pub fn build(&self, partition: Partition) -> Job {
        Job {
            partition,
            file_name: self.file_name(partition),
            document: self.render(partition),
        }
    }
}

/// 📄 Read a custom mission header from disk.
pub fn read_header(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| {
        format!(
            "💀 The mission template '{}' could not be read. We stared at the path. The path stared back.",
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitions::VerticalFlip;

    fn template() -> JobTemplate {
        JobTemplate::new(
            "Hawaii/load.ini",
            GridGeometry {
                height: 1000,
                width: 2000,
                scale: 100,
                flip: VerticalFlip::None,
                cell_center: false,
            },
        )
    }

    #[test]
    fn the_one_where_file_names_are_unique_per_partition() {
        let template = template();
        assert_eq!(template.file_name(Partition { start: 0, end: 83 }), "Hawaii_0_83.mis");
        assert_ne!(
            template.file_name(Partition { start: 0, end: 83 }),
            template.file_name(Partition { start: 84, end: 166 })
        );
    }

    #[test]
    fn the_one_where_every_point_gets_a_wagon_in_order() {
        let job = template().build(Partition { start: 19, end: 21 });
        assert!(job.document.starts_with("[MAIN]\n  MAP Hawaii/load.ini\n"));
        let wagons: Vec<&str> = job
            .document
            .lines()
            .filter(|line| line.contains("_Static"))
            .collect();
        assert_eq!(
            wagons,
            vec![
                "  0_Static vehicles.stationary.Stationary$Wagon12 2 1900.00 0.00 360.00 0.0",
                "  1_Static vehicles.stationary.Stationary$Wagon12 2 0.00 100.00 360.00 0.0",
                "  2_Static vehicles.stationary.Stationary$Wagon12 2 100.00 100.00 360.00 0.0",
            ]
        );
    }

    #[test]
    fn the_one_where_a_custom_header_replaces_the_default() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mission.tpl");
        std::fs::write(&path, "[MAIN]\n  MAP {loader}\n  CUSTOM 1")?;
        let job = template()
            .with_header(read_header(&path)?)
            .build(Partition { start: 0, end: 0 });
        assert!(job.document.starts_with("[MAIN]\n  MAP Hawaii/load.ini\n  CUSTOM 1\n  0_Static"));
        Ok(())
    }
}
