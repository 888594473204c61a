//! Run-level error types.
//!
//! Per-exposure problems (an empty selection, a failed transform write) are
//! logged and recorded in the [`RunSummary`]; only the variants below abort a
//! calibration run.

use crate::association::AssociationError;
use crate::catalog::{ExposureId, SchemaError};
use crate::fit::EngineError;
use crate::run::RunSummary;
use crate::selection::SelectionError;
use std::io;
use thiserror::Error;

/// A required column, resource or parameter is missing or invalid.
///
/// Always raised before any partial work is committed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("exposure {id}: {source}")]
    Selection {
        id: ExposureId,
        #[source]
        source: SelectionError,
    },

    #[error("reference catalog has no magnitudes for filter '{0}'")]
    MissingFilter(String),

    #[error("no reference filter configured and the reference catalog declares none")]
    NoReferenceFilter,

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Errors that abort a calibration run
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("association failed: {0}")]
    Association(#[from] AssociationError),

    #[error("fit engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("no usable data: none of {exposures} exposures has selectable sources")]
    NoUsableData { exposures: usize },

    #[error("minimization failed, fitted transforms are not valid")]
    MinimizationFailed { summary: Box<RunSummary> },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
