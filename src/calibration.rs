//! Wavelength and amplitude calibration.
//!
//! Every device carries two wavelength calibrations in EEPROM:
//!
//! - **factory**: four polynomial coefficients written at production, always
//!   present and the authoritative fallback;
//! - **user**: up to ten `(pixel, wavelength)` support points from which a
//!   cubic is fitted on load. A point count of `0xFFFF` or `0` means the user
//!   never calibrated, which is represented as `None`.
//!
//! Both are expanded into one wavelength per pixel and must be strictly
//! monotonic. Amplitude correction comes as one `f32` factor per pixel, again
//! once from the factory and once from the user, and is clamped into
//! [`MIN_AMPLITUDE_FACTOR`, `MAX_AMPLITUDE_FACTOR`] as soon as it is read.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::eeprom::{self, layout, BlockState, Region};
use crate::error::{CcsError, Result};
use crate::protocol::NUM_PIXELS;
use crate::transport::UsbTransport;

/// Lower clamp of amplitude correction factors.
pub const MIN_AMPLITUDE_FACTOR: f32 = 0.001;
/// Upper clamp of amplitude correction factors.
pub const MAX_AMPLITUDE_FACTOR: f32 = 1000.0;

/// Dark offset used when the stored value fails its checksum.
pub const DEFAULT_DARK_OFFSET: u16 = 0xFFFF;

const POLY_DEGREE: usize = 3;
const NUM_COEFFICIENTS: usize = POLY_DEGREE + 1;

// Relative singular value below which the fit counts as rank deficient.
const RANK_TOLERANCE: f64 = 1e-12;

/// Which wavelength calibration to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationSource {
    /// Factory polynomial
    Factory,
    /// Polynomial fitted to the user support points
    User,
}

// =============================================================================
// Wavelength calibration
// =============================================================================

/// Pixel to wavelength mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct WavelengthCalibration {
    /// Polynomial coefficients, ascending order
    pub poly: [f64; NUM_COEFFICIENTS],
    /// Smallest wavelength in nm
    pub min: f64,
    /// Largest wavelength in nm
    pub max: f64,
    /// Wavelength of each pixel in nm
    pub wavelengths: Vec<f64>,
}

impl WavelengthCalibration {
    /// Expand `poly` over all pixels.
    ///
    /// # Errors
    ///
    /// [`CcsError::InvalidCalibrationData`] when the curve is not strictly
    /// monotonic.
    pub fn from_poly(poly: [f64; NUM_COEFFICIENTS]) -> Result<Self> {
        let (wavelengths, min, max) = poly_to_wavelength_array(&poly)?;
        Ok(Self {
            poly,
            min,
            max,
            wavelengths,
        })
    }

    /// Whether wavelength grows with pixel index.
    pub fn is_ascending(&self) -> bool {
        self.wavelengths[1] > self.wavelengths[0]
    }
}

/// Evaluate `poly` at `x` (Horner).
pub fn eval_poly(poly: &[f64; NUM_COEFFICIENTS], x: f64) -> f64 {
    poly[0] + x * (poly[1] + x * (poly[2] + x * poly[3]))
}

/// Expand a cubic into one wavelength per pixel and return it with the
/// minimum and maximum wavelength.
pub fn poly_to_wavelength_array(poly: &[f64; NUM_COEFFICIENTS]) -> Result<(Vec<f64>, f64, f64)> {
    let wl: Vec<f64> = (0..NUM_PIXELS).map(|i| eval_poly(poly, i as f64)).collect();

    let ascending = if wl[1] > wl[0] {
        true
    } else if wl[1] < wl[0] {
        false
    } else {
        return Err(CcsError::invalid_calibration(format!(
            "wavelength of pixels 0 and 1 is indistinguishable ({} nm)",
            wl[0]
        )));
    };

    for i in 2..NUM_PIXELS {
        let ok = if ascending {
            wl[i] > wl[i - 1]
        } else {
            wl[i] < wl[i - 1]
        };
        if !ok {
            return Err(CcsError::invalid_calibration(format!(
                "wavelength not monotonic at pixel {} ({} nm after {} nm)",
                i,
                wl[i],
                wl[i - 1]
            )));
        }
    }

    let (min, max) = if ascending {
        (wl[0], wl[NUM_PIXELS - 1])
    } else {
        (wl[NUM_PIXELS - 1], wl[0])
    };
    Ok((wl, min, max))
}

/// Least-squares cubic through `points` (`(pixel, wavelength)` pairs),
/// ascending coefficients.
///
/// Solved by SVD on a Vandermonde matrix whose abscissa is scaled into
/// `[-1, 1]`; a rank-deficient system is rejected.
pub fn polyfit(points: &[(f64, f64)]) -> Result<[f64; NUM_COEFFICIENTS]> {
    if points.len() < NUM_COEFFICIENTS {
        return Err(CcsError::invalid_calibration(format!(
            "{} support points, a cubic fit needs at least {}",
            points.len(),
            NUM_COEFFICIENTS
        )));
    }

    let scale = points.iter().map(|(x, _)| x.abs()).fold(0.0f64, f64::max);
    if !scale.is_finite() || scale == 0.0 || points.iter().any(|(_, y)| !y.is_finite()) {
        return Err(CcsError::invalid_calibration("support points are not usable"));
    }

    let vandermonde = DMatrix::from_fn(points.len(), NUM_COEFFICIENTS, |i, j| {
        (points[i].0 / scale).powi(j as i32)
    });
    let rhs = DVector::from_iterator(points.len(), points.iter().map(|(_, y)| *y));

    let svd = vandermonde.svd(true, true);
    let largest = svd.singular_values.iter().copied().fold(0.0f64, f64::max);
    let smallest = svd.singular_values.iter().copied().fold(f64::INFINITY, f64::min);
    let eps = largest * RANK_TOLERANCE;
    if smallest.is_nan() || smallest <= eps {
        return Err(CcsError::invalid_calibration(
            "support points do not determine a cubic (too few distinct pixels)",
        ));
    }

    let c = svd
        .solve(&rhs, eps)
        .map_err(|e| CcsError::invalid_calibration(format!("least-squares solve failed: {}", e)))?;

    let mut poly = [0.0f64; NUM_COEFFICIENTS];
    for (j, coef) in poly.iter_mut().enumerate() {
        *coef = c[j] / scale.powi(j as i32);
    }
    Ok(poly)
}

// =============================================================================
// User support points
// =============================================================================

/// User calibration support points.
#[derive(Debug, Clone, PartialEq)]
pub struct UserCalibrationPoints {
    /// Pixel indices
    pub pixels: Vec<u32>,
    /// Wavelengths in nm, same length as `pixels`
    pub wavelengths: Vec<f64>,
}

impl UserCalibrationPoints {
    /// Number of points.
    pub fn count(&self) -> usize {
        self.pixels.len()
    }

    /// Fit the user polynomial.
    pub fn fit(&self) -> Result<WavelengthCalibration> {
        let points: Vec<(f64, f64)> = self
            .pixels
            .iter()
            .zip(&self.wavelengths)
            .map(|(&p, &w)| (f64::from(p), w))
            .collect();
        WavelengthCalibration::from_poly(polyfit(&points)?)
    }
}

// =============================================================================
// Amplitude correction and dark offsets
// =============================================================================

/// Per-pixel amplitude correction.
#[derive(Debug, Clone, PartialEq)]
pub struct AmplitudeCorrection {
    /// One factor per pixel, inside the clamp band
    pub factors: Vec<f32>,
    /// CRC-16 of the stored array
    pub checksum: u16,
}

impl AmplitudeCorrection {
    /// All factors 1.0.
    pub fn neutral() -> Self {
        Self {
            factors: vec![1.0; NUM_PIXELS],
            checksum: 0,
        }
    }

    /// Sanitize raw factors: non-finite values become 1.0, everything is
    /// clamped into the allowed band.
    pub fn from_factors(raw: Vec<f32>, checksum: u16) -> Self {
        let mut replaced = 0usize;
        let factors = raw
            .into_iter()
            .map(|f| {
                let f = if f.is_finite() {
                    f
                } else {
                    replaced += 1;
                    1.0
                };
                f.clamp(MIN_AMPLITUDE_FACTOR, MAX_AMPLITUDE_FACTOR)
            })
            .collect();
        if replaced > 0 {
            warn!(replaced, "Non-finite amplitude factors replaced by 1.0");
        }
        Self { factors, checksum }
    }
}

/// Maximum dark offsets of even and odd pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DarkOffsets {
    /// Even pixels
    pub even: u16,
    /// Odd pixels
    pub odd: u16,
}

// =============================================================================
// EEPROM loaders
// =============================================================================

/// Read and expand the factory polynomial.
#[instrument(skip(transport))]
pub fn read_factory_calibration<T: UsbTransport + ?Sized>(transport: &mut T) -> Result<WavelengthCalibration> {
    let block = eeprom::read_region(transport, layout::FACTORY_COEF_DATA)?;
    let mut poly = [0.0f64; NUM_COEFFICIENTS];
    for (i, coef) in poly.iter_mut().enumerate() {
        *coef = block.f64_at(i * 8)?;
    }
    debug!(?poly, "factory polynomial");
    WavelengthCalibration::from_poly(poly)
}

/// Read the user support points, `None` when the user never calibrated.
#[instrument(skip(transport))]
pub fn read_user_points<T: UsbTransport + ?Sized>(transport: &mut T) -> Result<Option<UserCalibrationPoints>> {
    let count_block = eeprom::read_region(transport, layout::USER_POINTS_COUNT)?;
    let count = count_block.u16_at(0)?;
    if count == 0xFFFF || count == 0 {
        debug!(count, "no user calibration stored");
        return Ok(None);
    }

    let count = count as usize;
    if count > layout::MAX_USER_POINTS {
        return Err(CcsError::invalid_calibration(format!(
            "user point count {} exceeds {}",
            count,
            layout::MAX_USER_POINTS
        )));
    }

    let data = eeprom::read_region(transport, layout::USER_POINTS_DATA)?;
    let wavelength_offset = layout::MAX_USER_POINTS * 4;
    let mut pixels = Vec::with_capacity(count);
    let mut wavelengths = Vec::with_capacity(count);
    for i in 0..count {
        pixels.push(data.u32_at(i * 4)?);
        wavelengths.push(data.f64_at(wavelength_offset + i * 8)?);
    }
    Ok(Some(UserCalibrationPoints { pixels, wavelengths }))
}

/// Read one amplitude correction array.
pub fn read_amplitude_correction<T: UsbTransport + ?Sized>(
    transport: &mut T,
    region: Region,
) -> Result<AmplitudeCorrection> {
    let block = eeprom::read_region(transport, region)?;
    if block.state == BlockState::Unwritten {
        debug!(address = region.address, "amplitude correction never written, using 1.0");
        return Ok(AmplitudeCorrection::neutral());
    }
    let checksum = eeprom::crc16(&block.data);
    Ok(AmplitudeCorrection::from_factors(block.f32_values(), checksum))
}

/// Read both dark offsets; a field failing its checksum reads as
/// [`DEFAULT_DARK_OFFSET`].
pub fn read_dark_offsets<T: UsbTransport + ?Sized>(transport: &mut T) -> Result<DarkOffsets> {
    let mut read = |region: Region| -> Result<u16> {
        match eeprom::read_region(transport, region) {
            Ok(block) => block.u16_at(0),
            Err(e) if e.is_checksum() => {
                warn!(address = region.address, error = %e, "Dark offset corrupted, using default");
                Ok(DEFAULT_DARK_OFFSET)
            }
            Err(e) => Err(e),
        }
    };
    let even = read(layout::EVEN_OFFSET_MAX)?;
    let odd = read(layout::ODD_OFFSET_MAX)?;
    Ok(DarkOffsets { even, odd })
}

// =============================================================================
// Calibration set
// =============================================================================

/// Everything calibration-related read from one device.
#[derive(Debug, Clone)]
pub struct Calibration {
    /// Factory wavelength calibration
    pub factory: WavelengthCalibration,
    /// User wavelength calibration, `None` when absent
    pub user: Option<WavelengthCalibration>,
    /// Support points the user calibration was fitted to
    pub user_points: Option<UserCalibrationPoints>,
    /// Factory amplitude correction
    pub factory_amplitude: AmplitudeCorrection,
    /// User amplitude correction
    pub user_amplitude: AmplitudeCorrection,
    /// Dark offset maxima
    pub dark_offsets: DarkOffsets,
}

impl Calibration {
    /// Load the full calibration set from EEPROM.
    #[instrument(skip(transport))]
    pub fn read<T: UsbTransport + ?Sized>(transport: &mut T) -> Result<Self> {
        let factory = read_factory_calibration(transport)?;
        let user_points = read_user_points(transport)?;
        let user = user_points.as_ref().map(UserCalibrationPoints::fit).transpose()?;
        let factory_amplitude = read_amplitude_correction(transport, layout::ACOR_FACTORY)?;
        let user_amplitude = read_amplitude_correction(transport, layout::ACOR_USER)?;
        let dark_offsets = read_dark_offsets(transport)?;

        info!(
            factory_min = factory.min,
            factory_max = factory.max,
            user_points = user_points.as_ref().map_or(0, UserCalibrationPoints::count),
            "Calibration loaded"
        );

        Ok(Self {
            factory,
            user,
            user_points,
            factory_amplitude,
            user_amplitude,
            dark_offsets,
        })
    }

    /// Whether a valid user calibration exists.
    pub fn has_user_calibration(&self) -> bool {
        self.user.is_some()
    }

    /// Source picked when nothing else is requested.
    pub fn default_source(&self) -> CalibrationSource {
        if self.has_user_calibration() {
            CalibrationSource::User
        } else {
            CalibrationSource::Factory
        }
    }

    /// Calibration of the given source.
    pub fn get(&self, source: CalibrationSource) -> Result<&WavelengthCalibration> {
        match source {
            CalibrationSource::Factory => Ok(&self.factory),
            CalibrationSource::User => self
                .user
                .as_ref()
                .ok_or_else(|| CcsError::invalid_calibration("no valid user calibration on this device")),
        }
    }

    /// Per-pixel wavelengths of the given source.
    pub fn wavelengths(&self, source: CalibrationSource) -> Result<&[f64]> {
        Ok(&self.get(source)?.wavelengths)
    }
}
