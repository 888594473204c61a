//! Joint astrometric calibration of overlapping exposures.
//!
//! A calibration run takes the source catalogs of every exposure in a tract,
//! keeps the sources fit for astrometry, links them across exposures and to
//! an external reference catalog, and fits one polynomial distortion per
//! exposure together with the positions of all observed stars.
//!
//! ```text
//! ExposureRecord ─▶ SourceQualityFilter ─▶ Associations ─▶ PolyFitEngine
//!                                              ▲                 │
//!                             ReferenceCatalog ┘   FitConvergenceController
//!                                                                │
//!                                      TransformSink ◀─ emit_results
//! ```
//!
//! [`run::CalibrationRun`] wires these pieces together for one tract.

pub mod association;
pub mod catalog;
pub mod config;
pub mod emit;
pub mod error;
pub mod fit;
pub mod geometry;
pub mod photometry;
pub mod run;
pub mod selection;
pub mod synthetic;

pub use association::{
    Associations, CatalogAssociator, InMemoryReferenceCatalog, ReferenceCatalog, ReferenceMatcher,
};
pub use catalog::{Detection, ExposureId, ExposureMeta, ExposureRecord, SourceCatalog};
pub use config::{AssociationConfig, CalibrationConfig};
pub use emit::{emit_results, EmissionReport, JsonTransformStore, PersistenceError, TransformSink};
pub use error::{CalibrationError, ConfigurationError};
pub use fit::{
    Chi2, ConvergenceConfig, ConvergenceReport, CorrectedWcs, DistortionFitEngine,
    FitConvergenceController, FitStage, MinimizeOutcome, PolyFitEngine, TerminalState,
};
pub use run::{group_by_tract, CalibrationRun, RunSummary};
pub use selection::{SelectionConfig, SourceQualityFilter};
