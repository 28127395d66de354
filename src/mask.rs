//! Sample mask estimation from motor-integrated intensity.
//!
//! The diffracting sample region is segmented by:
//! 1. Integrating counts over all motor dimensions into a 2D intensity map
//! 2. Thresholding the integrated intensity
//! 3. Eroding with a 2x2 structuring element to remove isolated noise pixels
//! 4. Dilating with the mirrored element to recover the sample extent and
//!    bridge gaps (typically far more dilation than erosion)
//! 5. Optionally filling fully enclosed background holes

use std::collections::VecDeque;

use crate::volume::RawVolume;

/// Configuration for sample mask estimation.
///
/// The defaults are tuned for typical dark-field signal-to-noise and are
/// configuration, not policy; adjust per instrument.
#[derive(Debug, Clone)]
pub struct MaskConfig {
    /// Integrated count value above which a pixel is considered sample.
    /// Default: 200.0
    pub threshold: f32,

    /// Number of erosion passes with a 2x2 structuring element.
    /// Removes isolated bright noise pixels.
    /// Default: 3
    pub erosion_iterations: usize,

    /// Number of dilation passes with a 2x2 structuring element.
    /// Recovers extent lost to erosion and bridges gaps; deliberately much
    /// larger than the erosion count.
    /// Default: 25
    pub dilation_iterations: usize,

    /// Fill fully enclosed background holes in the final mask.
    /// Default: true
    pub fill_holes: bool,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            threshold: 200.0,
            erosion_iterations: 3,
            dilation_iterations: 25,
            fill_holes: true,
        }
    }
}

/// Binary detector-space mask; true where the sample diffracts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    rows: usize,
    cols: usize,
    data: Vec<bool>,
}

impl Mask {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        self.data[row * self.cols + col]
    }

    /// Flat row-major mask values.
    pub fn as_slice(&self) -> &[bool] {
        &self.data
    }

    /// Number of foreground pixels.
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }
}

/// Sum counts over all motor dimensions per detector pixel.
///
/// Accumulates exactly in 64-bit integers and converts once to `f32`; the
/// raw volume is neither promoted nor copied.
pub fn integrate(volume: &RawVolume) -> Vec<f32> {
    let shape = volume.shape();
    let frames = shape.frames_per_pixel();
    volume
        .counts()
        .chunks_exact(frames)
        .map(|px| px.iter().map(|&v| v as u64).sum::<u64>() as f32)
        .collect()
}

/// Segment the diffracting sample region of a scan.
pub fn estimate_mask(volume: &RawVolume, config: &MaskConfig) -> Mask {
    let shape = volume.shape();
    let rows = shape.rows();
    let cols = shape.cols();

    let integrated = integrate(volume);
    let mut data: Vec<bool> = integrated.iter().map(|&v| v > config.threshold).collect();

    for _ in 0..config.erosion_iterations {
        data = erode(&data, rows, cols);
    }
    for _ in 0..config.dilation_iterations {
        data = dilate(&data, rows, cols);
    }
    if config.fill_holes {
        fill_holes(&mut data, rows, cols);
    }

    Mask { rows, cols, data }
}

// ─── Binary morphology ──────────────────────────────────────────────────────
//
// 2x2 structuring element anchored at its top-left pixel; dilation uses the
// mirrored element so that dilation and erosion form an adjoint pair.
// Out-of-bounds counts as background.

fn erode(mask: &[bool], rows: usize, cols: usize) -> Vec<bool> {
    let mut out = vec![false; mask.len()];
    for r in 0..rows.saturating_sub(1) {
        for c in 0..cols.saturating_sub(1) {
            let i = r * cols + c;
            out[i] = mask[i] && mask[i + 1] && mask[i + cols] && mask[i + cols + 1];
        }
    }
    out
}

fn dilate(mask: &[bool], rows: usize, cols: usize) -> Vec<bool> {
    let mut out = vec![false; mask.len()];
    for r in 0..rows {
        for c in 0..cols {
            let i = r * cols + c;
            let mut v = mask[i];
            if c > 0 {
                v = v || mask[i - 1];
            }
            if r > 0 {
                v = v || mask[i - cols];
                if c > 0 {
                    v = v || mask[i - cols - 1];
                }
            }
            out[i] = v;
        }
    }
    out
}

/// Fill background regions not connected to the image border.
///
/// Flood-fills the background from every border pixel (4-connectivity);
/// background pixels the fill never reaches are enclosed holes and become
/// foreground.
fn fill_holes(mask: &mut [bool], rows: usize, cols: usize) {
    let mut reached = vec![false; mask.len()];
    let mut queue = VecDeque::new();

    let seed = |idx: usize, mask: &[bool], reached: &mut [bool], queue: &mut VecDeque<usize>| {
        if !mask[idx] && !reached[idx] {
            reached[idx] = true;
            queue.push_back(idx);
        }
    };

    for c in 0..cols {
        seed(c, mask, &mut reached, &mut queue);
        seed((rows - 1) * cols + c, mask, &mut reached, &mut queue);
    }
    for r in 0..rows {
        seed(r * cols, mask, &mut reached, &mut queue);
        seed(r * cols + cols - 1, mask, &mut reached, &mut queue);
    }

    while let Some(idx) = queue.pop_front() {
        let r = idx / cols;
        let c = idx % cols;
        if r > 0 {
            seed(idx - cols, mask, &mut reached, &mut queue);
        }
        if r + 1 < rows {
            seed(idx + cols, mask, &mut reached, &mut queue);
        }
        if c > 0 {
            seed(idx - 1, mask, &mut reached, &mut queue);
        }
        if c + 1 < cols {
            seed(idx + 1, mask, &mut reached, &mut queue);
        }
    }

    for (m, &r) in mask.iter_mut().zip(&reached) {
        if !*m && !r {
            *m = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeShape;

    /// Volume with a single motor frame per pixel holding the given 2D map,
    /// so the integrated image equals the map itself.
    fn volume_from_map(map: &[u16], rows: usize, cols: usize) -> RawVolume {
        let shape = VolumeShape::new(rows, cols, vec![1, 1]).unwrap();
        RawVolume::new(map.to_vec(), shape).unwrap()
    }

    fn raw_config() -> MaskConfig {
        MaskConfig {
            threshold: 200.0,
            erosion_iterations: 0,
            dilation_iterations: 0,
            fill_holes: false,
        }
    }

    #[test]
    fn test_integrate_sums_motor_dimensions() {
        let shape = VolumeShape::new(2, 2, vec![2, 3]).unwrap();
        let counts: Vec<u16> = (0..24).collect();
        let vol = RawVolume::new(counts, shape).unwrap();
        let integrated = integrate(&vol);
        // pixel (0,0) holds frames 0..6, pixel (0,1) frames 6..12, ...
        assert_eq!(integrated, vec![15.0, 51.0, 87.0, 123.0]);
    }

    #[test]
    fn test_raw_config_equals_threshold_comparison() {
        let map: Vec<u16> = vec![
            0, 500, 0, //
            201, 200, 199, //
            0, 0, 1000,
        ];
        let vol = volume_from_map(&map, 3, 3);
        let mask = estimate_mask(&vol, &raw_config());
        let expected: Vec<bool> = map.iter().map(|&v| v as f32 > 200.0).collect();
        assert_eq!(mask.as_slice(), &expected[..]);
    }

    #[test]
    fn test_erosion_removes_isolated_pixels() {
        // A single bright pixel has no 2x2 support and one erosion pass
        // removes it; a solid 3x3 block keeps its top-left 2x2 core.
        let mut map = vec![0u16; 8 * 8];
        map[1 * 8 + 6] = 1000; // isolated
        for r in 4..7 {
            for c in 1..4 {
                map[r * 8 + c] = 1000;
            }
        }
        let vol = volume_from_map(&map, 8, 8);
        let mask = estimate_mask(
            &vol,
            &MaskConfig {
                erosion_iterations: 1,
                dilation_iterations: 0,
                fill_holes: false,
                ..MaskConfig::default()
            },
        );
        assert!(!mask.get(1, 6));
        assert!(mask.get(4, 1));
        assert!(mask.get(5, 2));
        assert_eq!(mask.count(), 4);
    }

    #[test]
    fn test_dilation_recovers_extent() {
        let mut map = vec![0u16; 8 * 8];
        map[3 * 8 + 3] = 1000;
        let vol = volume_from_map(&map, 8, 8);
        let mask = estimate_mask(
            &vol,
            &MaskConfig {
                erosion_iterations: 0,
                dilation_iterations: 1,
                fill_holes: false,
                ..MaskConfig::default()
            },
        );
        // The mirrored 2x2 element grows the pixel down-right.
        assert!(mask.get(3, 3));
        assert!(mask.get(3, 4));
        assert!(mask.get(4, 3));
        assert!(mask.get(4, 4));
        assert_eq!(mask.count(), 4);
    }

    #[test]
    fn test_fill_holes_closes_enclosed_background() {
        // A foreground ring with a one-pixel hole in the middle.
        let mut map = vec![0u16; 7 * 7];
        for r in 2..5 {
            for c in 2..5 {
                map[r * 7 + c] = 1000;
            }
        }
        map[3 * 7 + 3] = 0;
        let vol = volume_from_map(&map, 7, 7);

        let open = estimate_mask(
            &vol,
            &MaskConfig {
                erosion_iterations: 0,
                dilation_iterations: 0,
                fill_holes: false,
                ..MaskConfig::default()
            },
        );
        assert!(!open.get(3, 3));

        let filled = estimate_mask(
            &vol,
            &MaskConfig {
                erosion_iterations: 0,
                dilation_iterations: 0,
                fill_holes: true,
                ..MaskConfig::default()
            },
        );
        assert!(filled.get(3, 3));
        assert_eq!(filled.count(), open.count() + 1);
        // Outside background stays background.
        assert!(!filled.get(0, 0));
        assert!(!filled.get(6, 6));
    }

    #[test]
    fn test_default_config_values() {
        let config = MaskConfig::default();
        assert_eq!(config.threshold, 200.0);
        assert_eq!(config.erosion_iterations, 3);
        assert_eq!(config.dilation_iterations, 25);
        assert!(config.fill_holes);
    }
}
