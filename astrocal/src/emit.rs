//! Writing fitted transforms and residual tuples.
//!
//! Output is written per exposure; a failure for one exposure is logged and
//! recorded, and the remaining exposures are still written.

use crate::catalog::ExposureId;
use crate::fit::{CorrectedWcs, DistortionFitEngine};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure to store one exposure's transform
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transform for exposure {id} rejected: {reason}")]
    Rejected { id: ExposureId, reason: String },
}

/// Destination of fitted transforms.
pub trait TransformSink {
    fn persist(&mut self, id: ExposureId, wcs: &CorrectedWcs) -> Result<(), PersistenceError>;
}

/// Stores each transform as `wcs_<visit>_<ccd>.json` in a directory.
#[derive(Debug, Clone)]
pub struct JsonTransformStore {
    dir: PathBuf,
}

impl JsonTransformStore {
    /// Use `dir` as output directory, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, id: ExposureId) -> PathBuf {
        self.dir.join(format!("wcs_{id}.json"))
    }

    /// Read back a stored transform.
    pub fn load(&self, id: ExposureId) -> std::io::Result<CorrectedWcs> {
        CorrectedWcs::load_from_file(self.path_for(id))
    }
}

impl TransformSink for JsonTransformStore {
    fn persist(&mut self, id: ExposureId, wcs: &CorrectedWcs) -> Result<(), PersistenceError> {
        let path = self.path_for(id);
        wcs.save_to_file(&path)?;
        log::debug!("Wrote {}", path.display());
        Ok(())
    }
}

/// What was written after a fit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmissionReport {
    /// Residual tuple path, if it was written
    pub residual_tuple: Option<PathBuf>,
    pub written: Vec<ExposureId>,
    /// Exposures whose transform could not be produced or stored, with the reason
    pub failed: Vec<(ExposureId, String)>,
}

/// Write the residual tuple, then produce and persist every exposure's transform.
pub fn emit_results<E: DistortionFitEngine + ?Sized>(
    engine: &E,
    tuple_path: &Path,
    sink: &mut dyn TransformSink,
) -> EmissionReport {
    let mut report = EmissionReport::default();

    match engine.write_residual_tuple(tuple_path) {
        Ok(()) => report.residual_tuple = Some(tuple_path.to_path_buf()),
        Err(e) => log::warn!("Could not write residual tuple {}: {e}", tuple_path.display()),
    }

    for id in engine.exposures() {
        let result = engine
            .produce_corrected_transform(id)
            .map_err(|e| e.to_string())
            .and_then(|wcs| sink.persist(id, &wcs).map_err(|e| e.to_string()));
        match result {
            Ok(()) => report.written.push(id),
            Err(reason) => {
                log::warn!("Failed to write WCS for exposure {id}: {reason}");
                report.failed.push((id, reason));
            }
        }
    }

    log::info!(
        "Wrote {} transforms, {} failed",
        report.written.len(),
        report.failed.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BoundingBox, SkyCoord, TanWcs};

    #[test]
    fn test_store_writes_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonTransformStore::new(dir.path().join("out")).unwrap();
        let id = ExposureId::new(1228, 49);
        let crval = SkyCoord::new(10.0, 20.0);
        let wcs = CorrectedWcs::from_tan_wcs(
            id,
            &TanWcs::from_scale([50.0, 50.0], crval, 0.2, 0.0),
            &BoundingBox::from_size(100, 100),
            crval,
            1,
        )
        .unwrap();

        store.persist(id, &wcs).unwrap();
        assert!(dir.path().join("out/wcs_1228_49.json").exists());
        assert_eq!(store.load(id).unwrap().id, id);
    }
}
