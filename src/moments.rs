//! Weighted first and second moments of a scan's counts distribution.
//!
//! For each detector pixel the counts over the motor grid are treated as a
//! non-negative weight function over the Cartesian product of the motor
//! axes. This module computes, per pixel:
//! 1. the weighted mean motor coordinate (first moment), and
//! 2. the weighted covariance of the motor coordinates (second moment).
//!
//! Counts are 16-bit integers and motor coordinates 32-bit floats, but all
//! accumulation runs at 64-bit precision: the covariance is formed from raw
//! moments and is sensitive to cancellation. Coordinates are additionally
//! shifted to a per-axis reference value during accumulation so the raw
//! moments stay small relative to the spreads they encode.
//!
//! Pixels with zero total weight produce NaN mean and covariance entries
//! rather than an error; downstream consumers treat NaN as "no signal".

use anyhow::Result;
use rayon::prelude::*;

use crate::volume::{MotorGrid, RawVolume};
use crate::{Matrix2, Matrix3};

/// Pixel count below which the moment loop runs sequentially; the rayon
/// dispatch overhead is not worth it for small detectors.
const PARALLEL_THRESHOLD: usize = 4096;

/// Per-pixel mean and covariance maps over motor-coordinate space.
///
/// `mean` has logical shape `(rows, cols, dim)` and `covariance`
/// `(rows, cols, dim, dim)`, both stored flat and row-major. The covariance
/// is symmetric in its trailing axes and positive semi-definite by
/// construction, though pixels with near-zero weight can show small negative
/// eigenvalues numerically.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentMaps {
    mean: Vec<f32>,
    covariance: Vec<f32>,
    rows: usize,
    cols: usize,
    dim: usize,
}

impl MomentMaps {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of motor dimensions (2 or 3).
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The full mean map, flat with logical shape `(rows, cols, dim)`.
    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    /// The full covariance map, flat with logical shape
    /// `(rows, cols, dim, dim)`.
    pub fn covariance(&self) -> &[f32] {
        &self.covariance
    }

    /// Mean motor coordinate at one pixel: a slice of `dim` values.
    pub fn mean_at(&self, row: usize, col: usize) -> &[f32] {
        let start = (row * self.cols + col) * self.dim;
        &self.mean[start..start + self.dim]
    }

    /// Motor-coordinate covariance at one pixel: a row-major slice of
    /// `dim * dim` values.
    pub fn covariance_at(&self, row: usize, col: usize) -> &[f32] {
        let d2 = self.dim * self.dim;
        let start = (row * self.cols + col) * d2;
        &self.covariance[start..start + d2]
    }

    /// Pixel covariance as a 2x2 matrix. `None` for 3D scans.
    pub fn covariance_matrix2(&self, row: usize, col: usize) -> Option<Matrix2> {
        if self.dim != 2 {
            return None;
        }
        let c = self.covariance_at(row, col);
        Some(Matrix2::new(c[0], c[1], c[2], c[3]))
    }

    /// Pixel covariance as a 3x3 matrix. `None` for 2D scans.
    pub fn covariance_matrix3(&self, row: usize, col: usize) -> Option<Matrix3> {
        if self.dim != 3 {
            return None;
        }
        let c = self.covariance_at(row, col);
        Some(Matrix3::new(
            c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7], c[8],
        ))
    }

    /// Misorientation map: per-pixel L2 norm of the mean map after
    /// subtracting the per-component median.
    ///
    /// The median is taken over pixels with signal (finite mean); NaN pixels
    /// propagate NaN. Returns a flat `(rows, cols)` map.
    pub fn misorientation(&self) -> Vec<f32> {
        let mut medians = [0f32; 3];
        for k in 0..self.dim {
            let mut vals: Vec<f32> = self
                .mean
                .iter()
                .skip(k)
                .step_by(self.dim)
                .copied()
                .filter(|v| v.is_finite())
                .collect();
            if vals.is_empty() {
                continue;
            }
            vals.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());
            let n = vals.len();
            medians[k] = if n % 2 == 0 {
                (vals[n / 2 - 1] + vals[n / 2]) / 2.0
            } else {
                vals[n / 2]
            };
        }

        self.mean
            .chunks_exact(self.dim)
            .map(|m| {
                let mut sq = 0f32;
                for k in 0..self.dim {
                    let d = m[k] - medians[k];
                    sq += d * d;
                }
                sq.sqrt()
            })
            .collect()
    }
}

// ── Moment computation ──────────────────────────────────────────────────────

/// Compute per-pixel weighted mean and covariance of the motor coordinates.
///
/// The motor grid must match the volume's trailing dimensions; a mismatch is
/// a broken reader and fails immediately. Output maps are freshly allocated
/// and do not alias the input.
///
/// Pixels are independent, so the loop is parallelized across the detector
/// for large frames.
pub fn moments(volume: &RawVolume, grid: &MotorGrid) -> Result<MomentMaps> {
    grid.validate_against(volume.shape())?;

    let shape = volume.shape();
    let rows = shape.rows();
    let cols = shape.cols();
    let dim = grid.dim();

    // ── Precompute the reference-shifted coordinate table ──
    // coords[f][k] is the k-th motor coordinate of flat frame index f, shifted
    // by the axis minimum. The shift cancels out of the covariance and is
    // added back to the mean.
    let mut refs = [0f64; 3];
    for k in 0..dim {
        refs[k] = grid.axis(k).min() as f64;
    }

    let dims = shape.motor_dims();
    let mut strides = [1usize; 3];
    for k in (0..dim.saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * dims[k + 1];
    }

    let frames = shape.frames_per_pixel();
    let mut coords = vec![[0f64; 3]; frames];
    for (idx, c) in coords.iter_mut().enumerate() {
        for k in 0..dim {
            let i = (idx / strides[k]) % dims[k];
            c[k] = grid.axis(k).values()[i] as f64 - refs[k];
        }
    }

    // ── Per-pixel accumulation ──
    let mut mean = vec![0f32; rows * cols * dim];
    let mut covariance = vec![0f32; rows * cols * dim * dim];

    let kernel = |pixel: usize, mean_px: &mut [f32], cov_px: &mut [f32]| {
        let counts = volume.pixel_counts(pixel / cols, pixel % cols);
        pixel_moments(counts, &coords, &refs, dim, mean_px, cov_px);
    };

    if rows * cols >= PARALLEL_THRESHOLD {
        mean.par_chunks_mut(dim)
            .zip(covariance.par_chunks_mut(dim * dim))
            .enumerate()
            .for_each(|(pixel, (m, c))| kernel(pixel, m, c));
    } else {
        for (pixel, (m, c)) in mean
            .chunks_mut(dim)
            .zip(covariance.chunks_mut(dim * dim))
            .enumerate()
        {
            kernel(pixel, m, c);
        }
    }

    Ok(MomentMaps {
        mean,
        covariance,
        rows,
        cols,
        dim,
    })
}

/// Accumulate weighted moments for one pixel's counts distribution.
///
/// `coords` holds reference-shifted motor coordinates per flat frame index.
/// With zero total weight every division is 0/0 and the outputs are NaN.
fn pixel_moments(
    counts: &[u16],
    coords: &[[f64; 3]],
    refs: &[f64; 3],
    dim: usize,
    mean: &mut [f32],
    cov: &mut [f32],
) {
    let mut w = 0f64;
    let mut s = [0f64; 3];
    let mut ss = [[0f64; 3]; 3];

    for (&cnt, c) in counts.iter().zip(coords) {
        if cnt == 0 {
            continue;
        }
        let wt = cnt as f64;
        w += wt;
        for k in 0..dim {
            s[k] += wt * c[k];
            for l in k..dim {
                ss[k][l] += wt * c[k] * c[l];
            }
        }
    }

    for k in 0..dim {
        mean[k] = (refs[k] + s[k] / w) as f32;
    }
    for k in 0..dim {
        for l in k..dim {
            let c = ss[k][l] / w - (s[k] / w) * (s[l] / w);
            cov[k * dim + l] = c as f32;
            cov[l * dim + k] = c as f32;
        }
    }
}
