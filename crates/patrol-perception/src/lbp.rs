//! Local Binary Pattern face descriptor.
//!
//! A frame is reduced to a fixed-size texture signature in five steps:
//!
//! 1. greyscale conversion,
//! 2. cropping to the [`FaceRegion`],
//! 3. global histogram equalisation (lighting normalisation),
//! 4. resampling to [`FACE_SIZE`]×[`FACE_SIZE`],
//! 5. 8-neighbour LBP codes, folded into the 59 "uniform" patterns and
//!    histogrammed over a [`GRID`]×[`GRID`] grid of cells.
//!
//! Each cell histogram is normalised to sum to one, so the mean per-cell
//! histogram intersection ([`Descriptor::similarity`]) lies in `[0, 1]` and
//! equals `1.0` for identical inputs.

use std::sync::OnceLock;

use image::GrayImage;
use image::imageops::{self, FilterType};
use imageproc::contrast::equalize_histogram;
use imageproc::local_binary_patterns::local_binary_pattern;
use patrol_hal::CameraFrame;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side length of the normalised face image.
pub const FACE_SIZE: u32 = 64;
/// Cells per side of the histogram grid.
pub const GRID: usize = 8;
/// 58 uniform patterns plus one bucket for everything else.
pub const BINS: usize = 59;
/// Smallest face region, in source pixels per side, worth describing.
pub const MIN_FACE_SIDE: u32 = 8;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("face region {width}x{height} is smaller than {MIN_FACE_SIDE}x{MIN_FACE_SIDE}")]
pub struct FaceTooSmall {
    pub width: u32,
    pub height: u32,
}

/// Where the face is expected in a frame.
///
/// A doorbell camera frames the visitor roughly centred, so the region is
/// the centred rectangle covering `fraction` of each dimension.  `1.0` uses
/// the whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    fraction: f32,
}

impl FaceRegion {
    pub const DEFAULT_FRACTION: f32 = 0.6;

    /// `fraction` is clamped to `(0, 1]`.
    pub fn centre(fraction: f32) -> Self {
        let fraction = if fraction.is_finite() && fraction > 0.0 {
            fraction.min(1.0)
        } else {
            1.0
        };
        Self { fraction }
    }

    pub fn whole_frame() -> Self {
        Self::centre(1.0)
    }

    pub fn fraction(&self) -> f32 {
        self.fraction
    }

    /// Greyscale crop of `frame` covering the region.
    pub fn extract(&self, frame: &CameraFrame) -> Result<GrayImage, FaceTooSmall> {
        let gray = frame.to_luma8();
        let (w, h) = gray.dimensions();
        let cw = ((w as f32 * self.fraction).round() as u32).clamp(1, w);
        let ch = ((h as f32 * self.fraction).round() as u32).clamp(1, h);
        if cw < MIN_FACE_SIDE || ch < MIN_FACE_SIDE {
            return Err(FaceTooSmall {
                width: cw,
                height: ch,
            });
        }
        if (cw, ch) == (w, h) {
            return Ok(gray);
        }
        Ok(imageops::crop_imm(&gray, (w - cw) / 2, (h - ch) / 2, cw, ch).to_image())
    }
}

impl Default for FaceRegion {
    fn default() -> Self {
        Self::centre(Self::DEFAULT_FRACTION)
    }
}

/// Texture signature of one face image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// `GRID * GRID` cell histograms of `BINS` entries each, row-major.
    cells: Vec<f32>,
}

impl Descriptor {
    /// # Errors
    ///
    /// [`FaceTooSmall`] when the region of `frame` is too small to carry
    /// texture.
    pub fn from_frame(frame: &CameraFrame, region: FaceRegion) -> Result<Self, FaceTooSmall> {
        let face = equalize_histogram(&region.extract(frame)?);
        let face = imageops::resize(&face, FACE_SIZE, FACE_SIZE, FilterType::Triangle);
        Ok(Self::from_face(&face))
    }

    fn from_face(face: &GrayImage) -> Self {
        let table = uniform_table();
        let mut cells = vec![0.0_f32; GRID * GRID * BINS];
        let size = FACE_SIZE as usize;
        let inner = size - 2;
        for y in 1..size - 1 {
            for x in 1..size - 1 {
                let Some(code) = local_binary_pattern(face, x as u32, y as u32) else {
                    continue;
                };
                let cy = (y - 1) * GRID / inner;
                let cx = (x - 1) * GRID / inner;
                cells[(cy * GRID + cx) * BINS + table[code as usize] as usize] += 1.0;
            }
        }
        for cell in cells.chunks_mut(BINS) {
            let total: f32 = cell.iter().sum();
            if total > 0.0 {
                cell.iter_mut().for_each(|v| *v /= total);
            }
        }
        Self { cells }
    }

    /// Mean histogram intersection over all cells, in `[0, 1]`.
    ///
    /// Returns `0.0` for descriptors of different shape (e.g. loaded from an
    /// enrollment file written with other grid parameters).
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        if self.cells.len() != other.cells.len() || self.cells.is_empty() {
            return 0.0;
        }
        let total: f32 = self
            .cells
            .chunks(BINS)
            .zip(other.cells.chunks(BINS))
            .map(|(a, b)| a.iter().zip(b).map(|(x, y)| x.min(*y)).sum::<f32>())
            .sum();
        (total / (self.cells.len() / BINS) as f32).clamp(0.0, 1.0)
    }
}

/// Maps each 8-bit LBP code to its uniform-pattern bucket.
fn uniform_table() -> &'static [u8; 256] {
    static TABLE: OnceLock<[u8; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [(BINS - 1) as u8; 256];
        let mut next = 0u8;
        for code in 0..=255u8 {
            let transitions = (code ^ code.rotate_left(1)).count_ones();
            if transitions <= 2 {
                table[code as usize] = next;
                next += 1;
            }
        }
        table
    })
}
