//! Raw scan processing.
//!
//! A raw scan is [`NUM_RAW_PIXELS`] little-endian 16-bit ADC words. Words 16..28
//! sit behind the light shield and give the dark level; the calibrated pixels
//! start at word 32. Processing subtracts the dark level and normalizes to the
//! remaining ADC headroom:
//!
//! ```text
//! out[i] = (raw[32 + i] - dark) / (65535 - dark)
//! ```
//!
//! On top of that come three amplitude-corrected flavours:
//!
//! - factory: multiply by the factory factors;
//! - range: keep a wavelength window and flatten it with the user factors;
//! - noise-bounded: grow a window around a center wavelength for as long as
//!   the user factors stay within a noise amplification budget.
//!
//! Everything here is pure; the driver does the I/O.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::calibration::AmplitudeCorrection;
use crate::error::{CcsError, Result};
use crate::protocol::{
    DARK_LEVEL_THRESHOLD, DARK_PIXELS_OFFSET, MAX_ADC_VALUE, NUM_DARK_PIXELS, NUM_PIXELS, NUM_RAW_PIXELS,
    SCAN_PIXELS_OFFSET,
};

/// Default lower bound of the range correction, nm.
pub const DEFAULT_RANGE_MIN_WAVELENGTH: f64 = 321.45;
/// Default upper bound of the range correction, nm.
pub const DEFAULT_RANGE_MAX_WAVELENGTH: f64 = 742.11;
/// Default center of the noise-bounded correction, nm.
pub const DEFAULT_NOISE_CENTER_WAVELENGTH: f64 = 531.78;
/// Default noise amplification budget, dB.
pub const DEFAULT_NOISE_AMPLIFICATION_DB: f64 = 1.0;

/// Range-corrected spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeCorrectedScan {
    /// Normalized intensity, zero outside the window
    pub spectrum: Vec<f64>,
    /// Half-open pixel window
    pub pixels: Range<usize>,
    /// `10·log10(max/min)` of the user factors over the window
    pub noise_amplification_db: f64,
}

/// Noise-bounded spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseBoundedScan {
    /// Normalized intensity, zero outside the window
    pub spectrum: Vec<f64>,
    /// Half-open pixel window
    pub pixels: Range<usize>,
    /// Wavelength of the first pixel in the window, nm
    pub wavelength_left: f64,
    /// Wavelength of the last pixel in the window, nm
    pub wavelength_right: f64,
}

// =============================================================================
// Normalization
// =============================================================================

/// Mean of the shielded pixels.
pub fn dark_level(raw: &[u16]) -> f64 {
    let dark = &raw[DARK_PIXELS_OFFSET..DARK_PIXELS_OFFSET + NUM_DARK_PIXELS];
    dark.iter().map(|&w| f64::from(w)).sum::<f64>() / NUM_DARK_PIXELS as f64
}

/// Dark-subtract and normalize a raw scan.
///
/// # Errors
///
/// - [`CcsError::InvalidParameter`] for fewer than [`NUM_RAW_PIXELS`] words
/// - [`CcsError::Overexposure`] when the dark level is at or above 99 % of
///   full scale; no partial spectrum is returned
pub fn process_raw_scan(raw: &[u16]) -> Result<Vec<f64>> {
    if raw.len() < NUM_RAW_PIXELS {
        return Err(CcsError::invalid_parameter(format!(
            "raw scan has {} words, expected {}",
            raw.len(),
            NUM_RAW_PIXELS
        )));
    }

    let dark = dark_level(raw);
    let threshold = DARK_LEVEL_THRESHOLD * MAX_ADC_VALUE;
    if dark >= threshold {
        return Err(CcsError::Overexposure {
            dark_level: dark,
            threshold,
        });
    }

    let norm = 1.0 / (MAX_ADC_VALUE - dark);
    Ok(raw[SCAN_PIXELS_OFFSET..SCAN_PIXELS_OFFSET + NUM_PIXELS]
        .iter()
        .map(|&w| (f64::from(w) - dark) * norm)
        .collect())
}

/// Decode the little-endian words of a bulk transfer.
pub fn words_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

// =============================================================================
// Amplitude corrections
// =============================================================================

/// Multiply by the factory amplitude factors.
pub fn apply_factory_correction(spectrum: &mut [f64], factory: &AmplitudeCorrection) {
    for (value, &factor) in spectrum.iter_mut().zip(&factory.factors) {
        *value *= f64::from(factor);
    }
}

/// First pixel whose wavelength is strictly above `bound`.
fn first_above(wavelengths: &[f64], bound: f64) -> Option<usize> {
    wavelengths.iter().position(|&wl| wl > bound)
}

fn min_max(factors: &[f32]) -> (f64, f64) {
    factors.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &f| {
        (lo.min(f64::from(f)), hi.max(f64::from(f)))
    })
}

/// Keep `[min_wavelength, max_wavelength]` and flatten it with the user
/// factors, scaled so the weakest factor in the window is 1.
pub fn apply_range_correction(
    spectrum: &[f64],
    factory_wavelengths: &[f64],
    user: &AmplitudeCorrection,
    min_wavelength: f64,
    max_wavelength: f64,
) -> Result<RangeCorrectedScan> {
    if !(min_wavelength < max_wavelength) {
        return Err(CcsError::invalid_parameter(format!(
            "range [{}, {}] nm is empty or inverted",
            min_wavelength, max_wavelength
        )));
    }

    let lo = first_above(factory_wavelengths, min_wavelength).ok_or_else(|| {
        CcsError::invalid_parameter(format!("{} nm is beyond the calibrated span", min_wavelength))
    })?;
    // `hi` is the first pixel past `max_wavelength` and is zeroed with the rest
    let hi = first_above(factory_wavelengths, max_wavelength).unwrap_or(NUM_PIXELS);
    if lo >= hi {
        return Err(CcsError::invalid_parameter(format!(
            "no pixel between {} and {} nm",
            min_wavelength, max_wavelength
        )));
    }

    let (min, max) = min_max(&user.factors[lo..hi]);
    let noise_amplification_db = 10.0 * (max / min).log10();

    let out = spectrum
        .iter()
        .zip(&user.factors)
        .enumerate()
        .map(|(i, (&v, &f))| {
            if (lo..hi).contains(&i) {
                v * f64::from(f) / min
            } else {
                0.0
            }
        })
        .collect();

    Ok(RangeCorrectedScan {
        spectrum: out,
        pixels: lo..hi,
        noise_amplification_db,
    })
}

/// Grow a window around `center` while `max/min` of `factors` inside it stays
/// at or below `threshold`.
///
/// Each step first tries to extend both sides, then the left side alone, then
/// the right side alone. Returns the half-open window and the minimum factor
/// inside it.
pub fn find_centered_range(factors: &[f32], center: usize, threshold: f64) -> (Range<usize>, f64) {
    let n = factors.len();
    let at = |i: usize| f64::from(factors[i]);
    let (mut left, mut right) = (center, center);
    let (mut min, mut max) = (at(center), at(center));

    loop {
        if left > 0 && right < n - 1 {
            let lo = min.min(at(left - 1)).min(at(right + 1));
            let hi = max.max(at(left - 1)).max(at(right + 1));
            if hi / lo <= threshold {
                left -= 1;
                right += 1;
                (min, max) = (lo, hi);
                continue;
            }
        }
        if left > 0 {
            let lo = min.min(at(left - 1));
            let hi = max.max(at(left - 1));
            if hi / lo <= threshold {
                left -= 1;
                (min, max) = (lo, hi);
                continue;
            }
        }
        if right < n - 1 {
            let lo = min.min(at(right + 1));
            let hi = max.max(at(right + 1));
            if hi / lo <= threshold {
                right += 1;
                (min, max) = (lo, hi);
                continue;
            }
        }
        break;
    }

    (left..right + 1, min)
}

/// Largest window around `center_wavelength` whose user factors amplify noise
/// by at most `max_noise_db`, flattened like [`apply_range_correction`].
pub fn apply_noise_bounded_correction(
    spectrum: &[f64],
    factory_wavelengths: &[f64],
    user: &AmplitudeCorrection,
    center_wavelength: f64,
    max_noise_db: f64,
) -> Result<NoiseBoundedScan> {
    if !max_noise_db.is_finite() {
        return Err(CcsError::invalid_parameter(format!(
            "noise budget {} dB is not finite",
            max_noise_db
        )));
    }
    let center = factory_wavelengths
        .iter()
        .position(|&wl| wl >= center_wavelength)
        .ok_or_else(|| {
            CcsError::invalid_parameter(format!(
                "center {} nm is beyond the calibrated span",
                center_wavelength
            ))
        })?;

    let threshold = 10f64.powf(max_noise_db / 10.0);
    let (pixels, min) = find_centered_range(&user.factors, center, threshold);

    let out = spectrum
        .iter()
        .zip(&user.factors)
        .enumerate()
        .map(|(i, (&v, &f))| {
            if pixels.contains(&i) {
                v * f64::from(f) / min
            } else {
                0.0
            }
        })
        .collect();

    Ok(NoiseBoundedScan {
        spectrum: out,
        wavelength_left: factory_wavelengths[pixels.start],
        wavelength_right: factory_wavelengths[pixels.end - 1],
        pixels,
    })
}
