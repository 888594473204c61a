//! Top-level calibration configuration.

use crate::error::ConfigurationError;
use crate::fit::{ConvergenceConfig, EngineConfig};
use crate::selection::SelectionConfig;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Parameters of cross-exposure and reference matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Radius for linking detections across exposures, arcseconds
    pub match_radius_arcsec: f64,
    /// Radius for attaching reference stars, arcseconds
    pub reference_match_radius_arcsec: f64,
    /// Fitted stars seen fewer times are dropped, unless matched to a reference
    pub min_measurements: usize,
    /// Reference catalog filter. The catalog's first filter is used when unset.
    pub reference_filter: Option<String>,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            match_radius_arcsec: 3.0,
            reference_match_radius_arcsec: 3.0,
            min_measurements: 2,
            reference_filter: None,
        }
    }
}

/// Everything needed to calibrate one tract
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub selection: SelectionConfig,
    pub association: AssociationConfig,
    pub engine: EngineConfig,
    pub convergence: ConvergenceConfig,
}

impl CalibrationConfig {
    /// Check parameter ranges.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        fn invalid(name: &'static str, reason: &str) -> ConfigurationError {
            ConfigurationError::InvalidParameter {
                name,
                reason: reason.to_string(),
            }
        }

        if !(self.association.match_radius_arcsec > 0.0) {
            return Err(invalid("association.match_radius_arcsec", "must be positive"));
        }
        if !(self.association.reference_match_radius_arcsec > 0.0) {
            return Err(invalid(
                "association.reference_match_radius_arcsec",
                "must be positive",
            ));
        }
        if self.association.min_measurements == 0 {
            return Err(invalid("association.min_measurements", "must be at least 1"));
        }
        if !(self.engine.position_error_px >= 0.0) {
            return Err(invalid("engine.position_error_px", "must not be negative"));
        }
        if !(self.convergence.rejection_sigma > 0.0) {
            return Err(invalid("convergence.rejection_sigma", "must be positive"));
        }
        if !(self.selection.min_signal_to_noise >= 0.0) {
            return Err(invalid("selection.min_signal_to_noise", "must not be negative"));
        }
        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = CalibrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.degree, 3);
        assert_eq!(config.engine.position_error_px, 0.02);
        assert_eq!(config.association.match_radius_arcsec, 3.0);
        assert_eq!(config.convergence.max_iterations, 20);
        assert_eq!(config.convergence.rejection_sigma, 5.0);
    }

    #[test]
    fn test_rejects_non_positive_radius() {
        let mut config = CalibrationConfig::default();
        config.association.match_radius_arcsec = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidParameter {
                name: "association.match_radius_arcsec",
                ..
            })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = CalibrationConfig::default();
        config.engine.degree = 5;
        config.association.reference_filter = Some("i".to_string());
        config.selection.max_extendedness = Some(0.5);
        config.save_to_file(&path).unwrap();

        assert_eq!(CalibrationConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_sparse_json_keeps_defaults() {
        let config: CalibrationConfig =
            serde_json::from_str(r#"{"convergence": {"max_iterations": 7}}"#).unwrap();
        assert_eq!(config.convergence.max_iterations, 7);
        assert_eq!(config.convergence.rejection_sigma, 5.0);
        assert_eq!(config.selection, SelectionConfig::default());
    }
}
