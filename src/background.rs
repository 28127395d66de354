//! Background (noise-floor) estimation and subtraction.
//!
//! Detector images in this domain are mostly noise with sparse, very bright
//! diffraction signal. The estimator:
//! 1. Draws a random sample from the flattened counts buffer.
//! 2. Iteratively computes the sample median and standard deviation and
//!    rejects values outside a ~99.99% two-sided confidence bound; the
//!    rejected values are the diffraction signal.
//! 3. Returns the maximum of the converged noise sample, i.e. the far tail
//!    of the noise distribution, as a conservative noise/signal separator.
//!
//! Subtraction clamps at the background level before subtracting so the
//! unsigned counts cannot wrap.

use anyhow::{bail, ensure, Result};
use rand::Rng;

use crate::volume::RawVolume;

/// Number of counts sampled from the volume for noise estimation.
const NOISE_SAMPLE_SIZE: usize = 40_000;

/// Maximum number of rejection rounds.
const NOISE_REJECTION_ROUNDS: usize = 20;

/// Two-sided ~99.99% confidence bound on a normal distribution,
/// `2 * 3.891` standard deviations.
const NOISE_CONFIDENCE_FACTOR: f64 = 2.0 * 3.891;

/// Estimate the background level of a raw volume.
///
/// Returns the far tail of the noise distribution (see module docs). The
/// random sampling makes repeated calls on the same data agree only
/// approximately, not bit-for-bit.
///
/// Fails if the rejection loop empties the working sample, which happens on
/// degenerate input (for instance a constant buffer, where the confidence
/// bound collapses onto the single value); auto-thresholding must not
/// silently proceed with such an estimate.
pub fn estimate_background(volume: &RawVolume) -> Result<u16> {
    estimate_background_with_rng(volume, &mut rand::rng())
}

/// [`estimate_background`] with a caller-supplied random source, so tests
/// can seed it.
pub fn estimate_background_with_rng<R: Rng>(volume: &RawVolume, rng: &mut R) -> Result<u16> {
    let counts = volume.counts();
    ensure!(!counts.is_empty(), "cannot estimate background of an empty volume");

    let sample_size = counts.len().min(NOISE_SAMPLE_SIZE);
    let mut noise: Vec<u16> = (0..sample_size)
        .map(|_| counts[rng.random_range(0..counts.len())])
        .collect();

    for _ in 0..NOISE_REJECTION_ROUNDS {
        noise.sort_unstable();
        let n = noise.len();
        let median = if n % 2 == 0 {
            (noise[n / 2 - 1] as f64 + noise[n / 2] as f64) / 2.0
        } else {
            noise[n / 2] as f64
        };
        let mean = noise.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        let var = noise
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        let cutoff = median + NOISE_CONFIDENCE_FACTOR * var.sqrt();

        let before = noise.len();
        noise.retain(|&v| (v as f64) < cutoff);
        if noise.is_empty() {
            bail!(
                "background estimation rejected every sample \
                 (cutoff {cutoff:.2} after {before} survivors); \
                 the counts distribution is degenerate"
            );
        }
        if noise.len() == before {
            break; // converged
        }
    }

    // noise is sorted and nonempty
    Ok(*noise.last().unwrap())
}

/// Subtract a fixed background value from every count, in place.
///
/// Values below `value` clamp to zero instead of wrapping: the result is
/// `max(v, value) - value` elementwise.
pub fn subtract_in_place(volume: &mut RawVolume, value: u16) {
    if value == 0 {
        return;
    }
    for v in volume.counts_mut() {
        *v = v.saturating_sub(value);
    }
}
