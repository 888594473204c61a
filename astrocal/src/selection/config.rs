//! Configuration for astrometric source selection.

use crate::catalog::MeasurementFields;
use serde::{Deserialize, Serialize};

/// Parameters of the source quality gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Flags that reject a source when set. The flux algorithm's own flag is
    /// always added to this list.
    pub bad_flags: Vec<String>,
    /// Prefix of the flux measurement
    pub flux_field: String,
    /// Prefix of the centroid measurement
    pub centroid_field: String,
    /// Prefix of the adaptive-moment shape measurement
    pub shape_field: String,
    /// Faintest accepted magnitude
    pub max_magnitude: f64,
    /// Largest accepted magnitude error
    pub max_magnitude_error: f64,
    /// Smallest accepted flux / flux error
    pub min_signal_to_noise: f64,
    /// Reject sources whose extendedness exceeds this value. Disabled when `None`.
    pub max_extendedness: Option<f64>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            bad_flags: vec![
                "base_PixelFlags_flag_saturated".to_string(),
                "base_PixelFlags_flag_cr".to_string(),
                "base_PixelFlags_flag_interpolated".to_string(),
                "base_SdssCentroid_flag".to_string(),
                "base_SdssShape_flag".to_string(),
            ],
            flux_field: "base_CircularApertureFlux_17_0".to_string(),
            centroid_field: "base_SdssCentroid".to_string(),
            shape_field: "base_SdssShape".to_string(),
            max_magnitude: 22.5,
            max_magnitude_error: 0.1,
            min_signal_to_noise: 10.0,
            max_extendedness: None,
        }
    }
}

impl SelectionConfig {
    pub fn measurement_fields(&self) -> MeasurementFields {
        MeasurementFields {
            flux: self.flux_field.clone(),
            centroid: self.centroid_field.clone(),
            shape: self.shape_field.clone(),
        }
    }

    /// Every flag that rejects a source, including the flux failure flag.
    pub fn bad_flag_names(&self) -> Vec<String> {
        let mut names = self.bad_flags.clone();
        let flux_flag = self.measurement_fields().flux_flag();
        if !names.contains(&flux_flag) {
            names.push(flux_flag);
        }
        names
    }
}
