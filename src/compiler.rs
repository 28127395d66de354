//! Sequential compilation of many scan layers into 3D moment volumes.
//!
//! A [`LayerCompiler`] drives, for each layer identifier in order:
//! 1. load the layer through the reader (replacing the previous raw volume)
//! 2. optionally subtract a fixed or estimated background
//! 3. compute the per-pixel moment maps
//! 4. append them to the growing 3D stacks
//!
//! Only one raw volume is ever resident; the moment maps of all layers are
//! small by comparison and accumulate. Layer order in the input sequence is
//! the physical stacking order of the output volume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, info};

use crate::moments::MomentMaps;
use crate::scan::{Scan, ScanReader};
use crate::volume::Roi;

/// Background subtraction policy for layer compilation.
///
/// `Fixed(0)` is applied like any other fixed value (a no-op subtraction);
/// only `None` skips the thresholding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threshold {
    /// Leave the counts untouched.
    #[default]
    None,
    /// Subtract this value from every count, clamping at zero.
    Fixed(u16),
    /// Estimate the noise floor per layer and subtract it.
    Auto,
}

/// Configuration for [`LayerCompiler`].
#[derive(Debug, Clone, Default)]
pub struct CompileConfig {
    /// Background subtraction applied to every layer before moments.
    pub threshold: Threshold,
    /// Detector region of interest passed to the reader.
    pub roi: Option<Roi>,
}

/// Progress report delivered once per completed layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerProgress {
    /// Zero-based index of the completed layer.
    pub layer_index: usize,
    /// Total number of layers in this run.
    pub total_layers: usize,
    /// Wall time spent on this layer (load, threshold, moments, append).
    pub elapsed: Duration,
}

// ── The stacked output volumes ──────────────────────────────────────────────

/// Per-layer moment maps stacked into 3D volumes.
///
/// `mean` has logical shape `(layers, rows, cols, dim)` and `covariance`
/// `(layers, rows, cols, dim, dim)`, both flat and row-major; the layer axis
/// follows the compile-time input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MomentVolume {
    mean: Vec<f32>,
    covariance: Vec<f32>,
    layers: usize,
    rows: usize,
    cols: usize,
    dim: usize,
}

impl MomentVolume {
    pub fn num_layers(&self) -> usize {
        self.layers
    }

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

    pub fn is_empty(&self) -> bool {
        self.layers == 0
    }

    /// Logical shape of the stacked mean volume.
    pub fn mean_shape(&self) -> (usize, usize, usize, usize) {
        (self.layers, self.rows, self.cols, self.dim)
    }

    /// Logical shape of the stacked covariance volume.
    pub fn covariance_shape(&self) -> (usize, usize, usize, usize, usize) {
        (self.layers, self.rows, self.cols, self.dim, self.dim)
    }

    /// The full stacked mean volume, flat.
    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    /// The full stacked covariance volume, flat.
    pub fn covariance(&self) -> &[f32] {
        &self.covariance
    }

    /// Mean motor coordinate of one voxel: a slice of `dim` values.
    pub fn mean_at(&self, layer: usize, row: usize, col: usize) -> &[f32] {
        let start = ((layer * self.rows + row) * self.cols + col) * self.dim;
        &self.mean[start..start + self.dim]
    }

    /// Covariance of one voxel: a row-major slice of `dim * dim` values.
    pub fn covariance_at(&self, layer: usize, row: usize, col: usize) -> &[f32] {
        let d2 = self.dim * self.dim;
        let start = ((layer * self.rows + row) * self.cols + col) * d2;
        &self.covariance[start..start + d2]
    }

    fn push_layer(&mut self, maps: MomentMaps) -> Result<()> {
        if self.layers == 0 {
            self.rows = maps.rows();
            self.cols = maps.cols();
            self.dim = maps.dim();
        } else {
            ensure!(
                (maps.rows(), maps.cols(), maps.dim()) == (self.rows, self.cols, self.dim),
                "layer {} maps have shape ({}, {}, {}) but the volume is ({}, {}, {})",
                self.layers,
                maps.rows(),
                maps.cols(),
                maps.dim(),
                self.rows,
                self.cols,
                self.dim
            );
        }
        self.mean.extend_from_slice(maps.mean());
        self.covariance.extend_from_slice(maps.covariance());
        self.layers += 1;
        Ok(())
    }
}

// ── The compiler ────────────────────────────────────────────────────────────

type ProgressCallback = Box<dyn FnMut(&LayerProgress)>;

/// Drives a sequence of scan loads and accumulates 3D moment volumes.
///
/// Layers are processed strictly one after another; each layer's raw volume
/// is released before the next one is read. On failure the layers
/// accumulated so far remain available through [`LayerCompiler::volume`].
pub struct LayerCompiler<R: ScanReader> {
    scan: Scan<R>,
    config: CompileConfig,
    volume: MomentVolume,
    progress: Option<ProgressCallback>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<R: ScanReader> LayerCompiler<R> {
    pub fn new(reader: R, config: CompileConfig) -> Self {
        Self {
            scan: Scan::new(reader),
            config,
            volume: MomentVolume::default(),
            progress: None,
            cancel: None,
        }
    }

    /// Install a callback invoked once per completed layer.
    pub fn with_progress(mut self, callback: impl FnMut(&LayerProgress) + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Install a flag that, once set, aborts the run before the next layer
    /// load. A layer already in flight always runs to completion.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// The scan used for loading; exposes the reader.
    pub fn scan(&self) -> &Scan<R> {
        &self.scan
    }

    /// The moment volumes accumulated so far. After a failed or cancelled
    /// run this holds every layer that completed.
    pub fn volume(&self) -> &MomentVolume {
        &self.volume
    }

    /// Consume the compiler, keeping the accumulated volumes.
    pub fn into_volume(self) -> MomentVolume {
        self.volume
    }

    /// Compile a sequence of layers into stacked 3D moment volumes.
    ///
    /// Any previously accumulated volume is discarded at the start of the
    /// run. The first failing layer aborts the run; no retry is attempted.
    pub fn compile_layers<S: AsRef<str>>(&mut self, layer_ids: &[S]) -> Result<&MomentVolume> {
        self.volume = MomentVolume::default();
        let total = layer_ids.len();
        let mut total_time = Duration::ZERO;

        for (i, layer_id) in layer_ids.iter().enumerate() {
            let layer_id = layer_id.as_ref();
            if let Some(flag) = &self.cancel {
                if flag.load(Ordering::Relaxed) {
                    bail!("compilation cancelled before layer {} of {}", i + 1, total);
                }
            }

            let t0 = Instant::now();
            info!(layer = i + 1, total, layer_id, "reading scan");
            self.scan.load(layer_id, self.config.roi)?;

            match self.config.threshold {
                Threshold::None => {}
                Threshold::Fixed(value) => {
                    debug!(value, layer_id, "subtracting fixed background");
                    self.scan.subtract(value)?;
                }
                Threshold::Auto => {
                    let value = self
                        .scan
                        .estimate_background()
                        .with_context(|| format!("auto threshold failed for layer '{layer_id}'"))?;
                    info!(value, layer_id, "subtracting estimated background");
                    self.scan.subtract(value)?;
                }
            }

            debug!(layer_id, "computing moments");
            let maps = self.scan.compute_moments()?;
            self.volume.push_layer(maps)?;

            let elapsed = t0.elapsed();
            total_time += elapsed;
            let eta = total_time / (i as u32 + 1) * (total - i - 1) as u32;
            info!(
                layer = i + 1,
                total,
                elapsed_s = elapsed.as_secs_f64(),
                eta_s = eta.as_secs_f64(),
                "layer compiled"
            );
            if let Some(callback) = &mut self.progress {
                callback(&LayerProgress {
                    layer_index: i,
                    total_layers: total,
                    elapsed,
                });
            }
        }

        info!(total_s = total_time.as_secs_f64(), "layer compilation finished");
        Ok(&self.volume)
    }
}
