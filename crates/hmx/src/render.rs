//! 🎨 Renderer: turns a finished heightmap into pictures a human can squint at.
//!
//! Input is the raw output file: `rows × cols` little-endian `u16`s, row-major, where
//! `rows = height / scale` and `cols = width / scale`. Output is one RGB PNG per palette,
//! optionally with dark isolines every `isostep` metres drawn over the colours.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail, ensure};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use tracing::info;

use crate::common::{SAMPLE_WIDTH, Sample, unpack_samples};
use crate::partitions::checked_total_points;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Palette {
    /// Grayscale, scaled to the highest point.
    Bw,
    /// Blue → cyan → green → yellow → red.
    Jet,
    /// Fixed height bands, sea-green lowlands to brown peaks.
    Terra,
    /// A 10-stop blue-to-red ramp interpolated to 256 levels.
    Relief,
}

impl Palette {
    pub const ALL: [Palette; 4] = [Palette::Bw, Palette::Jet, Palette::Terra, Palette::Relief];

    pub fn slug(&self) -> &'static str {
        match self {
            Palette::Bw => "bw",
            Palette::Jet => "jet",
            Palette::Terra => "terra",
            Palette::Relief => "relief",
        }
    }
}

impl fmt::Display for Palette {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Palette {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match Palette::ALL.iter().find(|palette| palette.slug() == s) {
            Some(palette) => Ok(*palette),
            None => bail!("💀 Unknown palette '{s}'. Try one of: bw, jet, terra, relief."),
        }
    }
}

// (upper bound in metres, colour)
const TERRA_TINTS: [(Sample, [u8; 3]); 18] = [
    (100, [31, 156, 126]),
    (200, [126, 156, 32]),
    (300, [238, 215, 83]),
    (450, [242, 201, 83]),
    (650, [245, 187, 80]),
    (900, [226, 166, 70]),
    (1100, [210, 146, 59]),
    (1300, [196, 129, 48]),
    (1500, [184, 112, 38]),
    (1700, [180, 111, 33]),
    (2000, [180, 104, 28]),
    (2300, [175, 90, 23]),
    (2600, [171, 86, 19]),
    (2900, [166, 83, 15]),
    (3200, [160, 79, 13]),
    (3500, [156, 75, 10]),
    (3800, [151, 71, 8]),
    (4100, [151, 71, 0]),
];

const RELIEF_STOPS: [[f64; 3]; 10] = [
    [0.270_588, 0.458_824, 0.705_882],
    [0.454_902, 0.678_431, 0.819_608],
    [0.670_588, 0.850_980, 0.913_725],
    [0.878_431, 0.952_941, 0.972_549],
    [1.0, 1.0, 0.749_020],
    [0.996_078, 0.878_431, 0.564_706],
    [0.992_157, 0.682_353, 0.380_392],
    [0.956_863, 0.427_451, 0.262_745],
    [0.843_137, 0.188_235, 0.152_941],
    [0.647_059, 0.0, 0.149_020],
];

fn bw(v: Sample, vmax: Sample) -> [u8; 3] {
    let value = if vmax == 0 {
        0
    } else {
        (255.0 * f64::from(v) / f64::from(vmax)) as u8
    };
    [value; 3]
}

fn jet(v: Sample, vmax: Sample) -> [u8; 3] {
    let v = if vmax == 0 {
        0.0
    } else {
        (f64::from(v) / f64::from(vmax)).clamp(0.0, 1.0)
    };
    let (mut r, mut g, mut b) = (1.0, 1.0, 1.0);
    if v < 0.25 {
        r = 0.0;
        g = 4.0 * v;
    } else if v < 0.5 {
        r = 0.0;
        b = 1.0 + 4.0 * (0.25 - v);
    } else if v < 0.75 {
        r = 4.0 * (v - 0.5);
        b = 0.0;
    } else {
        g = 1.0 + 4.0 * (0.75 - v);
        b = 0.0;
    }
    [(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8]
}

fn terra(v: Sample) -> [u8; 3] {
    TERRA_TINTS
        .iter()
        .find(|(limit, _)| v < *limit)
        .map_or(TERRA_TINTS[TERRA_TINTS.len() - 1].1, |(_, color)| *color)
}

/// 🌈 The relief ramp sampled at 256 evenly spaced levels.
fn relief_lut() -> Vec<[u8; 3]> {
    let segments = (RELIEF_STOPS.len() - 1) as f64;
    (0..256)
        .map(|level| {
            let t = level as f64 / 255.0 * segments;
            let lower = (t.floor() as usize).min(RELIEF_STOPS.len() - 2);
            let frac = t - lower as f64;
            let (a, b) = (RELIEF_STOPS[lower], RELIEF_STOPS[lower + 1]);
            let channel = |i: usize| ((a[i] + (b[i] - a[i]) * frac) * 255.0).round() as u8;
            [channel(0), channel(1), channel(2)]
        })
        .collect()
}

/// 🎨 One RGB triple per sample, in sample order.
pub fn colorize(samples: &[Sample], palette: Palette) -> Vec<u8> {
    let vmax = samples.iter().copied().max().unwrap_or(0);
    let lut = match palette {
        Palette::Relief => relief_lut(),
        _ => Vec::new(),
    };
    let mut rgb = Vec::with_capacity(samples.len() * 3);
    for &v in samples {
        let color = match palette {
            Palette::Bw => bw(v, vmax),
            Palette::Jet => jet(v, vmax),
            Palette::Terra => terra(v),
            Palette::Relief => {
                let level = if vmax == 0 {
                    0
                } else {
                    (255.0 * f64::from(v) / f64::from(vmax)).round() as usize
                };
                lut[level.min(255)]
            }
        };
        rgb.extend_from_slice(&color);
    }
    rgb
}

const ISOLINE_COLOR: [u8; 3] = [0x30, 0x30, 0x30];

/// 〰️ Darken every pixel that sits on a band edge: its `v / isostep` band differs from
/// the pixel to its right or the one below it.
pub fn draw_isolines(samples: &[Sample], cols: usize, rgb: &mut [u8], isostep: u16) {
    if cols == 0 || isostep == 0 {
        return;
    }
    let band = |i: usize| samples[i] / isostep;
    for i in 0..samples.len() {
        let right = (i % cols + 1 < cols).then_some(i + 1);
        let below = (i + cols < samples.len()).then_some(i + cols);
        if [right, below].into_iter().flatten().any(|j| band(j) != band(i)) {
            rgb[i * 3..i * 3 + 3].copy_from_slice(&ISOLINE_COLOR);
        }
    }
}

/// 🖼️ Raw heightmap bytes → image. The byte count must match the grid exactly.
pub fn render_heightmap(
    bytes: &[u8],
    height: u64,
    width: u64,
    scale: u64,
    palette: Palette,
    isostep: Option<u16>,
) -> Result<RgbImage> {
    ensure!(scale > 0, "💀 scale must be positive");
    ensure!(isostep != Some(0), "💀 isostep must be at least 1 m");
    let rows = height / scale;
    let cols = width / scale;
    let expected = checked_total_points(height, width, scale)
        .and_then(|points| points.checked_mul(SAMPLE_WIDTH as u64))
        .context("💀 that map is too big to render")?;
    ensure!(
        bytes.len() as u64 == expected,
        "💀 heightmap holds {} bytes, but a {}×{} grid needs {}",
        bytes.len(),
        rows,
        cols,
        expected
    );
    let samples = unpack_samples(bytes);
    let mut rgb = colorize(&samples, palette);
    if let Some(isostep) = isostep {
        draw_isolines(&samples, cols as usize, &mut rgb, isostep);
    }
    let (cols, rows) = (
        u32::try_from(cols).context("💀 too many columns for an image")?,
        u32::try_from(rows).context("💀 too many rows for an image")?,
    );
    RgbImage::from_raw(cols, rows, rgb).context("💀 pixel buffer does not match the image size")
}

pub fn write_png(path: &Path, image: &RgbImage) -> Result<()> {
    let file = File::create(path).with_context(|| format!("💀 failed to create PNG at {}", path.display()))?;
    let encoder = PngEncoder::new_with_quality(BufWriter::new(file), CompressionType::Default, FilterType::Adaptive);
    encoder
        .write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)
        .with_context(|| format!("💀 failed to encode PNG at {}", path.display()))?;
    Ok(())
}

/// 🏷️ `maps/kuban.raw` + `jet` → `{out_dir or maps}/kuban.raw.jet.png`.
pub fn image_path(input: &Path, palette: Palette, out_dir: Option<&Path>) -> PathBuf {
    let file_name = format!(
        "{}.{}.png",
        input.file_name().map(|name| name.to_string_lossy()).unwrap_or_default(),
        palette.slug()
    );
    match out_dir.or_else(|| input.parent()) {
        Some(dir) => dir.join(file_name),
        None => PathBuf::from(file_name),
    }
}

/// 🚀 Read a raw heightmap from disk and write one PNG per palette. Returns the PNG paths.
pub fn render_file(
    input: &Path,
    height: u64,
    width: u64,
    scale: u64,
    palettes: &[Palette],
    isostep: Option<u16>,
    out_dir: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    let bytes = std::fs::read(input).with_context(|| format!("💀 could not read heightmap '{}'", input.display()))?;
    if let Some(dir) = out_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("💀 could not create '{}'", dir.display()))?;
    }
    let mut written = Vec::with_capacity(palettes.len());
    for &palette in palettes {
        let image = render_heightmap(&bytes, height, width, scale, palette, isostep)?;
        let path = image_path(input, palette, out_dir);
        write_png(&path, &image)?;
        info!("🎨 {} rendered to {}", palette, path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pack_samples;

    #[test]
    fn the_one_where_palettes_round_trip_through_their_names() -> Result<()> {
        for palette in Palette::ALL {
            assert_eq!(palette.slug().parse::<Palette>()?, palette);
        }
        assert!("sepia".parse::<Palette>().is_err());
        Ok(())
    }

    #[test]
    fn the_one_where_the_extremes_get_the_extreme_colours() {
        let samples = [0, 2000];
        assert_eq!(colorize(&samples, Palette::Bw), vec![0, 0, 0, 255, 255, 255]);
        assert_eq!(colorize(&samples, Palette::Jet), vec![0, 0, 255, 255, 0, 0]);
        assert_eq!(&colorize(&samples, Palette::Terra)[..3], &[31, 156, 126]);
        let relief = colorize(&samples, Palette::Relief);
        assert_eq!(&relief[..3], &[69, 117, 180]);
        assert_eq!(&relief[3..], &[165, 0, 38]);
    }

    #[test]
    fn the_one_where_a_flat_map_does_not_divide_by_zero() {
        assert_eq!(colorize(&[0, 0], Palette::Bw), vec![0; 6]);
        assert_eq!(colorize(&[0], Palette::Jet), vec![0, 0, 255]);
    }

    #[test]
    fn the_one_where_the_image_is_cols_wide_and_rows_tall() -> Result<()> {
        // 🧪 2 rows × 3 cols, the bright spot at row 1, col 2
        let bytes = pack_samples(&[0, 0, 0, 0, 0, 10]);
        let image = render_heightmap(&bytes, 200, 300, 100, Palette::Bw, None)?;
        assert_eq!((image.width(), image.height()), (3, 2));
        assert_eq!(image.get_pixel(2, 1).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);

        assert!(render_heightmap(&bytes[..10], 200, 300, 100, Palette::Bw, None).is_err());
        Ok(())
    }

    #[test]
    fn the_one_where_render_file_writes_one_png_per_palette() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("kuban.raw");
        std::fs::write(&input, pack_samples(&[1, 2, 3, 4]))?;
        let out_dir = dir.path().join("png");
        let written = render_file(&input, 200, 200, 100, &[Palette::Jet, Palette::Terra], Some(200), Some(&out_dir))?;
        assert_eq!(written, vec![out_dir.join("kuban.raw.jet.png"), out_dir.join("kuban.raw.terra.png")]);
        for path in written {
            assert!(std::fs::read(path)?.starts_with(b"\x89PNG"));
        }
        Ok(())
    }

    #[test]
    fn the_one_where_isolines_trace_the_step_between_two_levels() -> Result<()> {
        // 🧪 3 rows × 4 cols: a 100 m plain on the left, a 300 m plateau on the right
        let plain_then_plateau: [Sample; 4] = [100, 100, 300, 300];
        let bytes = pack_samples(&plain_then_plateau.repeat(3));
        let image = render_heightmap(&bytes, 300, 400, 100, Palette::Bw, Some(200))?;
        for row in 0..3 {
            assert_eq!(image.get_pixel(0, row).0, [85, 85, 85]);
            assert_eq!(image.get_pixel(1, row).0, ISOLINE_COLOR, "the last plain column borders the plateau");
            assert_eq!(image.get_pixel(2, row).0, [255, 255, 255]);
            assert_eq!(image.get_pixel(3, row).0, [255, 255, 255]);
        }

        // 🧪 a step inside one band draws nothing
        let quiet = render_heightmap(&bytes, 300, 400, 100, Palette::Bw, Some(1000))?;
        assert!(quiet.pixels().all(|pixel| pixel.0 != ISOLINE_COLOR));
        assert!(render_heightmap(&bytes, 300, 400, 100, Palette::Bw, Some(0)).is_err());
        Ok(())
    }

    #[test]
    fn the_one_where_an_isoline_also_runs_along_rows() {
        // 🧪 2 rows × 2 cols, the bottom row a band higher
        let samples = [10, 10, 60, 60];
        let mut rgb = vec![255; 12];
        draw_isolines(&samples, 2, &mut rgb, 50);
        assert_eq!(&rgb[..6], &[0x30; 6]);
        assert_eq!(&rgb[6..], &[255; 6]);
    }
}
