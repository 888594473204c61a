//! Zero-point photometric calibration.

use serde::{Deserialize, Serialize};
use std::f64::consts::LN_10;

/// Maps instrumental flux to AB-like magnitudes for one exposure.
///
/// ```text
/// mag    = -2.5 · log10(flux / flux_mag0)
/// magErr = 2.5 / ln(10) · sqrt((fluxErr / flux)² + (flux_mag0_err / flux_mag0)²)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhotometricCalibration {
    /// Flux of a zero-magnitude source
    pub flux_mag0: f64,
    /// Uncertainty on `flux_mag0`
    #[serde(default)]
    pub flux_mag0_err: f64,
}

impl PhotometricCalibration {
    pub fn new(flux_mag0: f64, flux_mag0_err: f64) -> Self {
        Self {
            flux_mag0,
            flux_mag0_err,
        }
    }

    /// Calibration with the given zero point magnitude, i.e. the magnitude of a
    /// source producing unit flux.
    pub fn from_zero_point(zero_point_mag: f64) -> Self {
        Self::new(10f64.powf(0.4 * zero_point_mag), 0.0)
    }

    /// Magnitude and magnitude error of a measured flux.
    ///
    /// Non-positive flux has no magnitude and yields `(+inf, +inf)`.
    pub fn magnitude(&self, flux: f64, flux_err: f64) -> (f64, f64) {
        if flux <= 0.0 {
            return (f64::INFINITY, f64::INFINITY);
        }
        let mag = -2.5 * (flux / self.flux_mag0).log10();
        let rel_flux = flux_err / flux;
        let rel_zero = self.flux_mag0_err / self.flux_mag0;
        let mag_err = 2.5 / LN_10 * (rel_flux * rel_flux + rel_zero * rel_zero).sqrt();
        (mag, mag_err)
    }

    /// Flux corresponding to a magnitude.
    pub fn flux(&self, mag: f64) -> f64 {
        self.flux_mag0 * 10f64.powf(-0.4 * mag)
    }
}

impl Default for PhotometricCalibration {
    fn default() -> Self {
        Self::from_zero_point(27.0)
    }
}
