//! One calibration run: selection, association, fit and emission.

use crate::association::{
    AssociationError, Associations, CatalogAssociator, ReferenceCatalog, ReferenceMatcher,
};
use crate::catalog::{ExposureId, ExposureMeta, ExposureRecord, SourceCatalog};
use crate::config::CalibrationConfig;
use crate::emit::{EmissionReport, TransformSink};
use crate::error::{CalibrationError, ConfigurationError};
use crate::fit::{
    ConvergenceReport, DistortionFitEngine, EngineConfig, EngineError, FitConvergenceController,
    PolyFitEngine, TerminalState,
};
use crate::selection::{Selection, SelectionStats, SourceQualityFilter};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Selection outcome of one exposure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposureSelection {
    pub id: ExposureId,
    pub stats: SelectionStats,
}

/// Outcome of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub selections: Vec<ExposureSelection>,
    /// Exposures left out because no source survived selection
    pub skipped: Vec<ExposureId>,
    pub fitted_stars: usize,
    pub reference_matches: usize,
    pub convergence: ConvergenceReport,
    pub emission: EmissionReport,
}

impl RunSummary {
    pub fn terminal(&self) -> TerminalState {
        self.convergence.terminal
    }
}

/// Session state of one calibration invocation, typically one tract.
pub struct CalibrationRun {
    config: CalibrationConfig,
    filter: SourceQualityFilter,
    accepted: Vec<(ExposureMeta, SourceCatalog)>,
    selections: Vec<ExposureSelection>,
    skipped: Vec<ExposureId>,
}

impl CalibrationRun {
    pub fn new(config: CalibrationConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let filter = SourceQualityFilter::new(config.selection.clone());
        Ok(Self {
            config,
            filter,
            accepted: Vec::new(),
            selections: Vec::new(),
            skipped: Vec::new(),
        })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Exposures added so far, including skipped ones.
    pub fn exposure_count(&self) -> usize {
        self.selections.len()
    }

    /// Select sources of every exposure, in parallel.
    ///
    /// Either all records are taken in or, on a schema problem in any of
    /// them, none are. Exposures left empty by selection are skipped with a
    /// warning. Returns the number of exposures kept.
    pub fn add_exposures(&mut self, records: &[ExposureRecord]) -> Result<usize, ConfigurationError> {
        let selections: Vec<Selection> = records
            .par_iter()
            .map(|record| {
                self.filter
                    .select(&record.catalog, &record.meta.calib)
                    .map_err(|source| ConfigurationError::Selection {
                        id: record.meta.id,
                        source,
                    })
            })
            .collect::<Result<_, _>>()?;

        let mut kept = 0;
        for (record, selection) in records.iter().zip(selections) {
            let id = record.meta.id;
            log::info!("Exposure {id}: {}", selection.stats);
            self.selections.push(ExposureSelection {
                id,
                stats: selection.stats,
            });

            if selection.catalog.is_empty() {
                log::warn!("No sources selected from exposure {id}, skipping it");
                self.skipped.push(id);
                continue;
            }
            self.accepted.push((record.meta.clone(), selection.catalog));
            kept += 1;
        }
        Ok(kept)
    }

    /// Calibrate with the polynomial engine.
    pub fn calibrate(
        self,
        refcat: &dyn ReferenceCatalog,
        sink: &mut dyn TransformSink,
        tuple_path: &Path,
    ) -> Result<RunSummary, CalibrationError> {
        self.calibrate_with(refcat, sink, tuple_path, PolyFitEngine::new)
    }

    /// Associate the selected catalogs, match them to `refcat`, fit with the
    /// engine built by `make_engine`, and emit the results.
    ///
    /// # Errors
    /// * [`CalibrationError::NoUsableData`] if no exposure has selected sources
    /// * [`CalibrationError::Configuration`] if no reference filter can be chosen
    ///   or the catalog lacks it
    /// * [`CalibrationError::MinimizationFailed`] if the fit ended `Failed`;
    ///   results have been emitted but must not be trusted
    pub fn calibrate_with<E, F>(
        self,
        refcat: &dyn ReferenceCatalog,
        sink: &mut dyn TransformSink,
        tuple_path: &Path,
        make_engine: F,
    ) -> Result<RunSummary, CalibrationError>
    where
        E: DistortionFitEngine,
        F: FnOnce(&Associations, &EngineConfig) -> Result<E, EngineError>,
    {
        if self.accepted.is_empty() {
            return Err(CalibrationError::NoUsableData {
                exposures: self.selections.len(),
            });
        }
        let filter = self
            .config
            .association
            .reference_filter
            .clone()
            .or_else(|| refcat.default_filter().map(str::to_string))
            .ok_or(ConfigurationError::NoReferenceFilter)?;

        let fields = self.config.selection.measurement_fields();
        let mut associations = Associations::new();
        for (meta, catalog) in self.accepted {
            associations.add_image(meta, &catalog, &fields)?;
        }
        associations.associate_catalogs(self.config.association.match_radius_arcsec)?;

        let (center, radius) = associations
            .sky_bounding_circle()
            .ok_or(AssociationError::NoImages)?;
        let references = refcat.load_sky_circle(&center, radius, &filter)?;
        let reference_matches = associations.collect_reference_stars(
            references,
            self.config.association.reference_match_radius_arcsec,
        )?;

        let fitted_stars = associations.select_fitted_stars(self.config.association.min_measurements);
        associations.deproject_fitted_stars()?;

        let mut engine = make_engine(&associations, &self.config.engine)?;
        let controller = FitConvergenceController::new(self.config.convergence.clone());
        let (convergence, emission) = controller.run_and_emit(&mut engine, tuple_path, sink);

        let summary = RunSummary {
            selections: self.selections,
            skipped: self.skipped,
            fitted_stars,
            reference_matches,
            convergence,
            emission,
        };

        match summary.terminal() {
            TerminalState::Failed => Err(CalibrationError::MinimizationFailed {
                summary: Box::new(summary),
            }),
            TerminalState::Exhausted => {
                log::warn!(
                    "Fit did not converge after {} iterations, results written anyway",
                    summary.convergence.iterations_run()
                );
                Ok(summary)
            }
            TerminalState::Converged => Ok(summary),
        }
    }
}

/// Split exposures by tract, in ascending tract order, each group sorted by exposure.
pub fn group_by_tract(records: Vec<ExposureRecord>) -> Vec<(u32, Vec<ExposureRecord>)> {
    let mut groups: BTreeMap<u32, Vec<ExposureRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.tract).or_default().push(record);
    }
    groups
        .into_iter()
        .map(|(tract, mut group)| {
            group.sort_by_key(|r| r.meta.id);
            (tract, group)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::InMemoryReferenceCatalog;
    use crate::catalog::{Detection, MeasurementFields};
    use crate::emit::JsonTransformStore;
    use crate::geometry::{BoundingBox, SkyCoord, TanWcs};
    use crate::photometry::PhotometricCalibration;

    fn record(tract: u32, visit: u32, detections: &[Detection]) -> ExposureRecord {
        let catalog = SourceCatalog::from_detections(
            &MeasurementFields::default(),
            &CalibrationConfig::default().selection.bad_flags,
            detections,
        )
        .unwrap();
        ExposureRecord {
            tract,
            meta: ExposureMeta {
                id: ExposureId::new(visit, 0),
                wcs: TanWcs::from_scale([50.0, 50.0], SkyCoord::new(0.0, 0.0), 0.2, 0.0),
                bbox: BoundingBox::from_size(100, 100),
                filter: "r".to_string(),
                calib: PhotometricCalibration::default(),
                instrument: "test".to_string(),
            },
            catalog,
        }
    }

    #[test]
    fn test_group_by_tract_orders_tracts_and_exposures() {
        let records = vec![record(9, 3, &[]), record(2, 5, &[]), record(9, 1, &[])];
        let groups = group_by_tract(records);
        let layout: Vec<(u32, Vec<u32>)> = groups
            .iter()
            .map(|(t, g)| (*t, g.iter().map(|r| r.meta.id.visit).collect()))
            .collect();
        assert_eq!(layout, vec![(2, vec![5]), (9, vec![1, 3])]);
    }

    #[test]
    fn test_empty_exposures_are_skipped() {
        let mut run = CalibrationRun::new(CalibrationConfig::default()).unwrap();
        let bright = Detection::point_source(1, 10.0, 10.0, 1e4, 10.0);
        let mut flagged = bright.clone();
        flagged.flags.push("base_PixelFlags_flag_cr".to_string());

        let kept = run
            .add_exposures(&[record(0, 1, &[bright]), record(0, 2, &[flagged])])
            .unwrap();
        assert_eq!(kept, 1);
        assert_eq!(run.exposure_count(), 2);
        assert_eq!(run.skipped, vec![ExposureId::new(2, 0)]);
    }

    #[test]
    fn test_no_usable_data() {
        let mut run = CalibrationRun::new(CalibrationConfig::default()).unwrap();
        let mut child = Detection::point_source(1, 10.0, 10.0, 1e4, 10.0);
        child.parent = 3;
        run.add_exposures(&[record(0, 1, &[child])]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonTransformStore::new(dir.path()).unwrap();
        let refcat = InMemoryReferenceCatalog::new(vec!["r".to_string()]);
        let result = run.calibrate(&refcat, &mut store, &dir.path().join("res_0.list"));
        assert!(matches!(result, Err(CalibrationError::NoUsableData { exposures: 1 })));
    }

    #[test]
    fn test_schema_error_commits_nothing() {
        let mut run = CalibrationRun::new(CalibrationConfig::default()).unwrap();
        let good = record(0, 1, &[Detection::point_source(1, 10.0, 10.0, 1e4, 10.0)]);
        let mut broken = record(0, 2, &[]);
        broken.catalog.schema.flag_fields.clear();

        let err = run.add_exposures(&[good, broken]);
        assert!(matches!(
            err,
            Err(ConfigurationError::Selection { id, .. }) if id == ExposureId::new(2, 0)
        ));
        assert_eq!(run.exposure_count(), 0);
    }

    #[test]
    fn test_missing_reference_filter() {
        let mut run = CalibrationRun::new(CalibrationConfig::default()).unwrap();
        run.add_exposures(&[record(0, 1, &[Detection::point_source(1, 10.0, 10.0, 1e4, 10.0)])])
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonTransformStore::new(dir.path()).unwrap();
        let refcat = InMemoryReferenceCatalog::default();
        let result = run.calibrate(&refcat, &mut store, &dir.path().join("res_0.list"));
        assert!(matches!(
            result,
            Err(CalibrationError::Configuration(ConfigurationError::NoReferenceFilter))
        ));
    }
}
