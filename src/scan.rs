//! The scan aggregate: one resident raw volume and the operations on it.
//!
//! A [`Scan`] owns at most one [`RawVolume`] together with its motor grid
//! and, once computed, the cached moment maps. Data comes in through a
//! [`ScanReader`], the seam behind which all file-format knowledge lives.
//!
//! Correct sequencing is load, then optional background subtraction, then
//! moments. Subtraction mutates the counts in place and deliberately does
//! not invalidate previously computed moment maps; recomputing after a
//! mutation is the caller's responsibility.

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::background;
use crate::mask::{self, Mask, MaskConfig};
use crate::moments::{self, MomentMaps};
use crate::volume::{MotorGrid, RawVolume, Roi};

/// The external reader contract.
///
/// Source-specific arguments (file paths, dataset names, motor names and
/// precisions, ...) are the implementor's own state; the core only supplies
/// the layer identifier and an optional detector ROI.
///
/// The returned motor grid must match the volume's trailing dimensions.
/// [`Scan::load`] re-validates this and rejects mismatches, but performs no
/// validation of the underlying storage format.
pub trait ScanReader {
    fn read_scan(&self, layer_id: &str, roi: Option<Roi>) -> Result<(RawVolume, MotorGrid)>;
}

/// One scan in memory: the raw counts volume, its motor grid, and cached
/// moment maps.
pub struct Scan<R: ScanReader> {
    reader: R,
    data: Option<(RawVolume, MotorGrid)>,
    maps: Option<MomentMaps>,
}

impl<R: ScanReader> Scan<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            data: None,
            maps: None,
        }
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    /// The resident raw volume, if a scan is loaded.
    pub fn volume(&self) -> Option<&RawVolume> {
        self.data.as_ref().map(|(v, _)| v)
    }

    /// The resident motor grid, if a scan is loaded.
    pub fn motors(&self) -> Option<&MotorGrid> {
        self.data.as_ref().map(|(_, g)| g)
    }

    /// Load a layer through the reader, replacing any resident volume.
    ///
    /// The resident volume and cached moment maps are released before the
    /// reader is invoked, so at most one raw volume exists at any point,
    /// including during the load itself.
    pub fn load(&mut self, layer_id: &str, roi: Option<Roi>) -> Result<()> {
        self.data = None;
        self.maps = None;

        let (volume, grid) = self
            .reader
            .read_scan(layer_id, roi)
            .with_context(|| format!("failed to read scan layer '{layer_id}'"))?;
        grid.validate_against(volume.shape())
            .with_context(|| format!("reader returned inconsistent shapes for layer '{layer_id}'"))?;

        debug!(
            layer_id,
            rows = volume.shape().rows(),
            cols = volume.shape().cols(),
            motor_dims = ?volume.shape().motor_dims(),
            "loaded scan"
        );
        self.data = Some((volume, grid));
        Ok(())
    }

    /// Subtract a fixed background value from the counts, in place.
    ///
    /// Values below `value` clamp to zero. Any previously computed moment
    /// maps are stale afterwards; call [`Scan::moments`] again.
    pub fn subtract(&mut self, value: u16) -> Result<()> {
        match self.data.as_mut() {
            Some((volume, _)) => {
                background::subtract_in_place(volume, value);
                Ok(())
            }
            None => bail!("no scan loaded"),
        }
    }

    /// Estimate the background level of the loaded scan.
    pub fn estimate_background(&self) -> Result<u16> {
        match self.data.as_ref() {
            Some((volume, _)) => background::estimate_background(volume),
            None => bail!("no scan loaded"),
        }
    }

    /// Integrate the counts over the motor dimensions into a flat
    /// `(rows, cols)` map.
    pub fn integrate(&self) -> Result<Vec<f32>> {
        match self.data.as_ref() {
            Some((volume, _)) => Ok(mask::integrate(volume)),
            None => bail!("no scan loaded"),
        }
    }

    /// Segment the diffracting sample region of the loaded scan.
    pub fn estimate_mask(&self, config: &MaskConfig) -> Result<Mask> {
        match self.data.as_ref() {
            Some((volume, _)) => Ok(mask::estimate_mask(volume, config)),
            None => bail!("no scan loaded"),
        }
    }

    /// Compute moment maps for the loaded scan without caching them.
    pub fn compute_moments(&self) -> Result<MomentMaps> {
        match self.data.as_ref() {
            Some((volume, grid)) => moments::moments(volume, grid),
            None => bail!("no scan loaded"),
        }
    }

    /// Compute and cache the moment maps, returning a reference.
    ///
    /// The cache lives until the next [`Scan::load`] or until taken with
    /// [`Scan::take_moments`].
    pub fn moments(&mut self) -> Result<&MomentMaps> {
        let maps = self.compute_moments()?;
        Ok(self.maps.insert(maps))
    }

    /// Cached moment maps from the last [`Scan::moments`] call, if any.
    pub fn cached_moments(&self) -> Option<&MomentMaps> {
        self.maps.as_ref()
    }

    /// Take ownership of the cached moment maps, leaving the cache empty.
    pub fn take_moments(&mut self) -> Option<MomentMaps> {
        self.maps.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{MotorAxis, VolumeShape};

    /// Serves small synthetic scans whose counts encode the layer id.
    struct FillReader;

    impl ScanReader for FillReader {
        fn read_scan(&self, layer_id: &str, _roi: Option<Roi>) -> Result<(RawVolume, MotorGrid)> {
            let fill: u16 = layer_id.parse().context("unknown layer")?;
            let shape = VolumeShape::new(2, 2, vec![2, 2])?;
            let volume = RawVolume::new(vec![fill; shape.len()], shape)?;
            let grid = MotorGrid::new(vec![
                MotorAxis::new(vec![0.0, 1.0])?,
                MotorAxis::new(vec![0.0, 1.0])?,
            ])?;
            Ok((volume, grid))
        }
    }

    /// Reader whose motor grid disagrees with the volume shape.
    struct BrokenReader;

    impl ScanReader for BrokenReader {
        fn read_scan(&self, _layer_id: &str, _roi: Option<Roi>) -> Result<(RawVolume, MotorGrid)> {
            let shape = VolumeShape::new(2, 2, vec![2, 2])?;
            let volume = RawVolume::new(vec![1; shape.len()], shape)?;
            let grid = MotorGrid::new(vec![
                MotorAxis::new(vec![0.0, 1.0, 2.0])?,
                MotorAxis::new(vec![0.0, 1.0])?,
            ])?;
            Ok((volume, grid))
        }
    }

    #[test]
    fn test_operations_require_a_load() {
        let mut scan = Scan::new(FillReader);
        assert!(!scan.is_loaded());
        assert!(scan.subtract(1).is_err());
        assert!(scan.estimate_background().is_err());
        assert!(scan.integrate().is_err());
        assert!(scan.estimate_mask(&MaskConfig::default()).is_err());
        assert!(scan.moments().is_err());
    }

    #[test]
    fn test_load_replaces_volume_and_invalidates_cache() {
        let mut scan = Scan::new(FillReader);
        scan.load("3", None).unwrap();
        assert_eq!(scan.volume().unwrap().counts()[0], 3);

        scan.moments().unwrap();
        assert!(scan.cached_moments().is_some());

        scan.load("7", None).unwrap();
        assert_eq!(scan.volume().unwrap().counts()[0], 7);
        assert!(scan.cached_moments().is_none(), "stale maps survived a load");
    }

    #[test]
    fn test_subtract_then_recompute() {
        let mut scan = Scan::new(FillReader);
        scan.load("5", None).unwrap();
        scan.subtract(2).unwrap();
        assert!(scan.volume().unwrap().counts().iter().all(|&v| v == 3));

        // Uniform weights: the mean is the grid center regardless of level.
        let maps = scan.moments().unwrap();
        assert_eq!(maps.mean_at(0, 0), &[0.5, 0.5]);
    }

    #[test]
    fn test_inconsistent_reader_shapes_are_rejected() {
        let mut scan = Scan::new(BrokenReader);
        let err = scan.load("1.1", None).unwrap_err();
        assert!(err.to_string().contains("1.1"));
        assert!(!scan.is_loaded());
    }

    #[test]
    fn test_reader_failure_propagates() {
        let mut scan = Scan::new(FillReader);
        assert!(scan.load("not-a-number", None).is_err());
        assert!(!scan.is_loaded());
    }

    #[test]
    fn test_take_moments_empties_cache() {
        let mut scan = Scan::new(FillReader);
        scan.load("1", None).unwrap();
        scan.moments().unwrap();
        let maps = scan.take_moments().unwrap();
        assert_eq!(maps.dim(), 2);
        assert!(scan.cached_moments().is_none());
        assert!(scan.take_moments().is_none());
    }
}
