//! Distortion fitting: the engine boundary, the reference polynomial engine
//! and the convergence controller that drives it.

pub mod controller;
pub mod poly_engine;
pub mod transform;

pub use controller::{
    ConvergenceConfig, ConvergenceReport, FitConvergenceController, StageRecord, TerminalState,
};
pub use poly_engine::{EngineConfig, PolyFitEngine};
pub use transform::CorrectedWcs;

use crate::catalog::ExposureId;
use meter_math::LinearSolveError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Errors reported by a fit engine outside of minimization
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("exposure {0} is not part of the fit")]
    UnknownExposure(ExposureId),

    #[error("catalogs must be associated before building the fit")]
    NotAssociated,

    #[error("no valid measurements to fit")]
    NoData,

    #[error("initial mapping of exposure {id} could not be fitted: {source}")]
    Initialization {
        id: ExposureId,
        #[source]
        source: LinearSolveError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Parameter groups adjusted by one minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitStage {
    /// Per-exposure mapping coefficients, star positions held fixed
    Distortions,
    /// Star positions, mappings held fixed
    Positions,
    DistortionsAndPositions,
}

impl FitStage {
    pub fn fits_distortions(self) -> bool {
        matches!(self, FitStage::Distortions | FitStage::DistortionsAndPositions)
    }

    pub fn fits_positions(self) -> bool {
        matches!(self, FitStage::Positions | FitStage::DistortionsAndPositions)
    }
}

impl fmt::Display for FitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FitStage::Distortions => "Distortions",
            FitStage::Positions => "Positions",
            FitStage::DistortionsAndPositions => "DistortionsAndPositions",
        };
        f.write_str(s)
    }
}

/// Result of one staged minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinimizeOutcome {
    /// Parameters settled and no outliers were left to remove
    Converged,
    /// Outliers were removed and chi2 went up on the following step
    OutliersRemainButChi2Increased,
    /// The system could not be solved; parameter state is not trustworthy
    Failed,
    /// A status the controller does not know, with its raw code
    OtherUnexpected(i32),
}

impl MinimizeOutcome {
    /// Interpret an integer engine status: 0 converged, 1 chi2 increased, 2 failed.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => MinimizeOutcome::Converged,
            1 => MinimizeOutcome::OutliersRemainButChi2Increased,
            2 => MinimizeOutcome::Failed,
            other => MinimizeOutcome::OtherUnexpected(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            MinimizeOutcome::Converged => 0,
            MinimizeOutcome::OutliersRemainButChi2Increased => 1,
            MinimizeOutcome::Failed => 2,
            MinimizeOutcome::OtherUnexpected(code) => code,
        }
    }
}

/// Total chi-square and degrees of freedom of the fit.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Chi2 {
    pub chi2: f64,
    pub ndof: usize,
}

impl Chi2 {
    pub fn reduced(&self) -> f64 {
        if self.ndof == 0 {
            f64::NAN
        } else {
            self.chi2 / self.ndof as f64
        }
    }
}

impl fmt::Display for Chi2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chi2/ndof : {:.3}/{} = {:.4}", self.chi2, self.ndof, self.reduced())
    }
}

/// A parametric distortion model fitted to associated measurements.
///
/// The engine owns its parameter state; a [`FitConvergenceController`] holds
/// it exclusively while sequencing minimizations.
pub trait DistortionFitEngine {
    /// Refine the parameters named by `stage`. With `rejection_sigma`, also
    /// remove terms whose chi2 exceeds the mean by that many standard
    /// deviations and refit until none remain.
    fn minimize(&mut self, stage: FitStage, rejection_sigma: Option<f64>) -> MinimizeOutcome;

    fn compute_chi2(&self) -> Chi2;

    /// Exposures that receive a corrected transform, in emission order.
    fn exposures(&self) -> Vec<ExposureId>;

    fn produce_corrected_transform(&self, id: ExposureId) -> Result<CorrectedWcs, EngineError>;

    /// Write one row per fit term for offline quality assessment.
    fn write_residual_tuple(&self, path: &Path) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_codes() {
        assert_eq!(MinimizeOutcome::from_code(0), MinimizeOutcome::Converged);
        assert_eq!(
            MinimizeOutcome::from_code(1),
            MinimizeOutcome::OutliersRemainButChi2Increased
        );
        assert_eq!(MinimizeOutcome::from_code(2), MinimizeOutcome::Failed);
        assert_eq!(MinimizeOutcome::from_code(3), MinimizeOutcome::OtherUnexpected(3));
        assert_eq!(MinimizeOutcome::from_code(-1).code(), -1);
    }

    #[test]
    fn test_stage_parameter_groups() {
        assert!(FitStage::Distortions.fits_distortions());
        assert!(!FitStage::Distortions.fits_positions());
        assert!(FitStage::Positions.fits_positions());
        assert!(FitStage::DistortionsAndPositions.fits_distortions());
        assert!(FitStage::DistortionsAndPositions.fits_positions());
    }

    #[test]
    fn test_reduced_chi2() {
        let chi2 = Chi2 { chi2: 50.0, ndof: 25 };
        assert_eq!(chi2.reduced(), 2.0);
        assert!(Chi2::default().reduced().is_nan());
    }
}
