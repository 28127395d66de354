//! # darkmap
//!
//! Memory-bounded reduction of **dark-field X-ray microscopy** scans into
//! per-pixel statistical maps.
//!
//! A scan records a full detector frame at every point of a 2D or 3D motor
//! grid, so a single layer is a 4D or 5D block of 16-bit counts, often
//! several gigabytes. `darkmap` reduces each layer to compact maps and
//! stacks many layers into 3D volumes while keeping only one raw scan in
//! memory at a time.
//!
//! ## Features
//!
//! - **Moment maps** — per-pixel weighted mean and covariance of the motor
//!   coordinates, accumulated at 64-bit precision, parallelized across the
//!   detector
//! - **Background estimation** — iterative outlier rejection isolates the
//!   noise distribution and returns its far tail as a subtraction level
//! - **Sample masking** — motor-integrated intensity thresholding with
//!   binary erosion, dilation, and hole filling
//! - **Layer compilation** — streams an ordered sequence of scan layers
//!   into stacked 3D mean/covariance volumes, one resident raw volume at a
//!   time, with progress reporting and cooperative cancellation
//! - **Reader seam** — all file-format knowledge lives behind the
//!   [`ScanReader`] trait; the core never touches storage
//!
//! ## Example
//!
//! ```
//! use darkmap::{
//!     CompileConfig, LayerCompiler, MotorAxis, MotorGrid, RawVolume, Roi, ScanReader,
//!     VolumeShape,
//! };
//!
//! // A reader serving synthetic data; real readers wrap an on-disk format
//! // and carry their source arguments as fields.
//! struct ConstantReader;
//!
//! impl ScanReader for ConstantReader {
//!     fn read_scan(
//!         &self,
//!         _layer_id: &str,
//!         _roi: Option<Roi>,
//!     ) -> anyhow::Result<(RawVolume, MotorGrid)> {
//!         let shape = VolumeShape::new(4, 4, vec![3, 3])?;
//!         let volume = RawVolume::new(vec![1; shape.len()], shape)?;
//!         let grid = MotorGrid::new(vec![
//!             MotorAxis::new(vec![0.0, 1.0, 2.0])?,
//!             MotorAxis::new(vec![0.0, 1.0, 2.0])?,
//!         ])?;
//!         Ok((volume, grid))
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut compiler = LayerCompiler::new(ConstantReader, CompileConfig::default());
//! let volume = compiler.compile_layers(&["1.1", "2.1"])?;
//! assert_eq!(volume.mean_shape(), (2, 4, 4, 2));
//! assert_eq!(volume.mean_at(0, 0, 0), &[1.0, 1.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline overview
//!
//! 1. **Load** — a [`ScanReader`] produces one layer's [`RawVolume`] and
//!    [`MotorGrid`]; the previous layer's volume is released first
//! 2. **Threshold** (optional) — subtract a fixed or estimated background,
//!    clamping so the unsigned counts cannot wrap
//! 3. **Moments** — per-pixel weighted mean and covariance over the motor
//!    grid; zero-weight pixels carry NaN ("no signal")
//! 4. **Accumulate** — per-layer maps append to the 3D stacks in layer order

pub mod background;
pub mod compiler;
pub mod mask;
pub mod moments;
pub mod scan;
pub mod volume;

pub use background::{estimate_background, estimate_background_with_rng, subtract_in_place};
pub use compiler::{CompileConfig, LayerCompiler, LayerProgress, MomentVolume, Threshold};
pub use mask::{estimate_mask, integrate, Mask, MaskConfig};
pub use moments::{moments, MomentMaps};
pub use scan::{Scan, ScanReader};
pub use volume::{MotorAxis, MotorGrid, RawVolume, Roi, VolumeShape};

// Commonly used types
// Note: maps are stored as 32-bit floats; all moment accumulation runs at
// 64-bit internally, where 32 bits are not accurate enough.
pub type Matrix2 = nalgebra::Matrix2<f32>;
pub type Matrix3 = nalgebra::Matrix3<f32>;
