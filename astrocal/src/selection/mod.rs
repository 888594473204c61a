//! Quality gate deciding which detections may constrain the astrometric fit.
//!
//! Each detection is judged on its own by [`rejection_reason`], a pure
//! function of one record, the resolved column keys and the exposure's
//! photometric calibration. Gates are checked in this order, the first
//! failing gate names the rejection:
//!
//! 1. any bad flag is set
//! 2. negative flux
//! 3. too faint, magnitude error too large, or signal-to-noise too low
//! 4. deblended child (`parent != 0`)
//! 5. more than one peak in the footprint
//! 6. implied centroid covariance is not positive semi-definite
//! 7. extended source (only when `max_extendedness` is configured)
//!
//! The magnitude gates are written in acceptance form (`!(mag <= limit)`),
//! so a NaN flux falls through the sign check and is rejected as too faint.
//! A NaN centroid sigma fails the covariance gate. A NaN cross term, which
//! the shape moments yield when they are all zero, carries no correlation
//! and is accepted.

pub mod config;

pub use config::SelectionConfig;

use crate::catalog::{
    FlagKey, FloatKey, SchemaError, SourceCatalog, SourceRecord, StandardKeys, EXTENDEDNESS_FIELD,
};
use crate::photometry::PhotometricCalibration;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors returned by [`SourceQualityFilter::select`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectionError {
    #[error("catalog schema does not support selection: {0}")]
    Schema(#[from] SchemaError),
}

/// Why a detection was not selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RejectReason {
    BadFlag,
    NegativeFlux,
    TooFaint,
    MagnitudeErrorTooLarge,
    LowSignalToNoise,
    DeblendedChild,
    MultiplePeaks,
    InvalidCovariance,
    Extended,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::BadFlag => "bad flag",
            RejectReason::NegativeFlux => "negative flux",
            RejectReason::TooFaint => "too faint",
            RejectReason::MagnitudeErrorTooLarge => "magnitude error too large",
            RejectReason::LowSignalToNoise => "low signal-to-noise",
            RejectReason::DeblendedChild => "deblended child",
            RejectReason::MultiplePeaks => "multiple peaks",
            RejectReason::InvalidCovariance => "invalid centroid covariance",
            RejectReason::Extended => "extended",
        };
        f.write_str(s)
    }
}

/// Column keys and limits for one catalog, resolved before any record is judged.
#[derive(Debug, Clone)]
pub struct SelectionKeys {
    pub measurement: StandardKeys,
    pub bad_flags: Vec<FlagKey>,
    pub extendedness: Option<FloatKey>,
    pub max_magnitude: f64,
    pub max_magnitude_error: f64,
    pub min_signal_to_noise: f64,
    pub max_extendedness: Option<f64>,
}

impl SelectionKeys {
    /// Resolve every column `config` refers to.
    ///
    /// # Errors
    /// The first measurement field or flag missing from the schema.
    pub fn resolve(config: &SelectionConfig, catalog: &SourceCatalog) -> Result<Self, SchemaError> {
        let schema = &catalog.schema;
        let measurement = config.measurement_fields().resolve(schema)?;
        let bad_flags = config
            .bad_flag_names()
            .iter()
            .map(|name| schema.flag_key(name))
            .collect::<Result<Vec<_>, _>>()?;
        let extendedness = match config.max_extendedness {
            Some(_) => Some(schema.float_key(EXTENDEDNESS_FIELD)?),
            None => None,
        };

        Ok(Self {
            measurement,
            bad_flags,
            extendedness,
            max_magnitude: config.max_magnitude,
            max_magnitude_error: config.max_magnitude_error,
            min_signal_to_noise: config.min_signal_to_noise,
            max_extendedness: config.max_extendedness,
        })
    }
}

/// First gate that `record` fails, or `None` if it is usable.
pub fn rejection_reason(
    record: &SourceRecord,
    keys: &SelectionKeys,
    calib: &PhotometricCalibration,
) -> Option<RejectReason> {
    if keys.bad_flags.iter().any(|&k| record.flag(k)) {
        return Some(RejectReason::BadFlag);
    }

    let flux = record.get(keys.measurement.flux);
    let flux_sigma = record.get(keys.measurement.flux_sigma);
    if flux < 0.0 {
        return Some(RejectReason::NegativeFlux);
    }

    let (mag, mag_err) = calib.magnitude(flux, flux_sigma);
    if !(mag <= keys.max_magnitude) {
        return Some(RejectReason::TooFaint);
    }
    if !(mag_err <= keys.max_magnitude_error) {
        return Some(RejectReason::MagnitudeErrorTooLarge);
    }
    if !(flux / flux_sigma >= keys.min_signal_to_noise) {
        return Some(RejectReason::LowSignalToNoise);
    }

    if record.parent != 0 {
        return Some(RejectReason::DeblendedChild);
    }
    if record.footprint_peaks > 1 {
        return Some(RejectReason::MultiplePeaks);
    }

    let (vx, vy, vxy) = keys.measurement.position_variances(record);
    if vx < 0.0 || vy < 0.0 || vxy * vxy > vx * vy || vx.is_nan() || vy.is_nan() {
        return Some(RejectReason::InvalidCovariance);
    }

    if let (Some(key), Some(max)) = (keys.extendedness, keys.max_extendedness) {
        // Unclassified (NaN) sources are kept
        if record.get(key) > max {
            return Some(RejectReason::Extended);
        }
    }

    None
}

/// Tally of a selection pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelectionStats {
    pub input: usize,
    pub kept: usize,
    pub rejected: BTreeMap<RejectReason, usize>,
}

impl SelectionStats {
    pub fn rejected_for(&self, reason: RejectReason) -> usize {
        self.rejected.get(&reason).copied().unwrap_or(0)
    }
}

impl fmt::Display for SelectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kept {}/{}", self.kept, self.input)?;
        for (reason, count) in &self.rejected {
            write!(f, ", {reason}: {count}")?;
        }
        Ok(())
    }
}

/// Selected sources and the tally that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub catalog: SourceCatalog,
    pub stats: SelectionStats,
}

/// Filters detection catalogs down to sources fit to constrain the astrometry.
#[derive(Debug, Clone, Default)]
pub struct SourceQualityFilter {
    config: SelectionConfig,
}

impl SourceQualityFilter {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Select the usable detections of `catalog`, preserving their order.
    ///
    /// The input is not modified. Running `select` on its own output returns
    /// the same catalog.
    ///
    /// # Errors
    /// [`SelectionError::Schema`] if a configured column is missing or a record
    /// does not match the schema. No record is evaluated in that case.
    pub fn select(
        &self,
        catalog: &SourceCatalog,
        calib: &PhotometricCalibration,
    ) -> Result<Selection, SelectionError> {
        catalog.validate()?;
        let keys = SelectionKeys::resolve(&self.config, catalog)?;

        let mut stats = SelectionStats {
            input: catalog.len(),
            ..Default::default()
        };
        let mut selected = SourceCatalog::new(catalog.schema.clone());

        for record in &catalog.records {
            match rejection_reason(record, &keys, calib) {
                None => selected.records.push(record.clone()),
                Some(reason) => *stats.rejected.entry(reason).or_insert(0) += 1,
            }
        }
        stats.kept = selected.len();

        log::debug!("source selection: {stats}");
        Ok(Selection {
            catalog: selected,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Detection, MeasurementFields};

    fn catalog_of(detections: &[Detection]) -> SourceCatalog {
        let config = SelectionConfig::default();
        SourceCatalog::from_detections(
            &MeasurementFields::default(),
            &config.bad_flags,
            detections,
        )
        .unwrap()
    }

    fn judge(det: Detection, config: &SelectionConfig) -> Option<RejectReason> {
        let catalog = catalog_of(&[det]);
        let keys = SelectionKeys::resolve(config, &catalog).unwrap();
        rejection_reason(&catalog.records[0], &keys, &PhotometricCalibration::default())
    }

    fn good() -> Detection {
        // mag 27 - 2.5 log10(1e4) = 17, S/N 100
        Detection::point_source(1, 100.0, 200.0, 1e4, 100.0)
    }

    #[test]
    fn test_good_source_passes() {
        assert_eq!(judge(good(), &SelectionConfig::default()), None);
    }

    #[test]
    fn test_flux_flag_rejects() {
        let mut det = good();
        det.flags.push("base_CircularApertureFlux_17_0_flag".to_string());
        assert_eq!(judge(det, &SelectionConfig::default()), Some(RejectReason::BadFlag));
    }

    #[test]
    fn test_faint_source_rejected() {
        // mag 27 - 2.5 log10(10) = 24.5
        let det = Detection::point_source(1, 0.0, 0.0, 10.0, 0.01);
        assert_eq!(judge(det, &SelectionConfig::default()), Some(RejectReason::TooFaint));
    }

    #[test]
    fn test_zero_flux_is_too_faint() {
        let det = Detection::point_source(1, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(judge(det, &SelectionConfig::default()), Some(RejectReason::TooFaint));
    }

    #[test]
    fn test_nan_flux_is_rejected_as_too_faint() {
        let det = Detection::point_source(1, 0.0, 0.0, f64::NAN, 1.0);
        assert_eq!(judge(det, &SelectionConfig::default()), Some(RejectReason::TooFaint));
    }

    #[test]
    fn test_zero_shape_moments_are_kept() {
        let mut det = good();
        det.xx = 0.0;
        det.yy = 0.0;
        det.xy = 0.0;
        assert_eq!(judge(det.clone(), &SelectionConfig::default()), None);

        let selection = SourceQualityFilter::default()
            .select(&catalog_of(&[det]), &PhotometricCalibration::default())
            .unwrap();
        assert_eq!(selection.stats.kept, 1);
    }

    #[test]
    fn test_nan_variance_is_rejected() {
        let mut det = good();
        det.y_sigma = f64::NAN;
        assert_eq!(
            judge(det, &SelectionConfig::default()),
            Some(RejectReason::InvalidCovariance)
        );
    }

    #[test]
    fn test_extendedness_only_when_configured() {
        let mut det = good();
        det.extendedness = 1.0;
        assert_eq!(judge(det.clone(), &SelectionConfig::default()), None);

        let config = SelectionConfig {
            max_extendedness: Some(0.5),
            ..Default::default()
        };
        assert_eq!(judge(det, &config), Some(RejectReason::Extended));
    }

    #[test]
    fn test_missing_flag_column_fails_before_evaluation() {
        let catalog = catalog_of(&[good()]);
        let config = SelectionConfig {
            bad_flags: vec!["base_PixelFlags_flag_edge".to_string()],
            ..Default::default()
        };
        let result = SourceQualityFilter::new(config).select(&catalog, &PhotometricCalibration::default());
        assert_eq!(
            result,
            Err(SelectionError::Schema(SchemaError::MissingFlag(
                "base_PixelFlags_flag_edge".to_string()
            )))
        );
    }

    #[test]
    fn test_stats_tally() {
        let mut child = good();
        child.parent = 7;
        let mut blended = good();
        blended.footprint_peaks = 2;
        let catalog = catalog_of(&[good(), child, blended, good()]);

        let selection = SourceQualityFilter::default()
            .select(&catalog, &PhotometricCalibration::default())
            .unwrap();
        assert_eq!(selection.stats.input, 4);
        assert_eq!(selection.stats.kept, 2);
        assert_eq!(selection.stats.rejected_for(RejectReason::DeblendedChild), 1);
        assert_eq!(selection.stats.rejected_for(RejectReason::MultiplePeaks), 1);
        assert_eq!(selection.stats.rejected_for(RejectReason::BadFlag), 0);
    }
}
