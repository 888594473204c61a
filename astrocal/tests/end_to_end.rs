use approx::assert_relative_eq;
use astrocal::fit::CorrectedWcs;
use astrocal::synthetic::{self, SyntheticConfig, SyntheticField, TrueExposure};
use astrocal::{
    group_by_tract, CalibrationConfig, CalibrationRun, InMemoryReferenceCatalog,
    JsonTransformStore, TerminalState,
};

/// RMS sky error in arcseconds of `pixel_to_sky` over the true stars on an exposure.
fn rms_arcsec<F>(field: &SyntheticField, truth: &TrueExposure, pixel_to_sky: F) -> f64
where
    F: Fn(f64, f64) -> astrocal::geometry::SkyCoord,
{
    let errors: Vec<f64> = field
        .stars
        .iter()
        .filter_map(|star| {
            let (x, y) = truth.sky_to_pixel(&star.sky)?;
            truth
                .bbox
                .contains(x, y)
                .then(|| pixel_to_sky(x, y).separation(&star.sky) * 3600.0)
        })
        .collect();
    assert!(errors.len() > 20, "too few stars on exposure {}", truth.id);
    (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
}

#[test]
fn test_synthetic_tract_calibration() {
    let _ = env_logger::builder().is_test(true).try_init();
    let field = synthetic::generate(&SyntheticConfig::default()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut store = JsonTransformStore::new(dir.path()).unwrap();
    let tuple_path = dir.path().join("res_0.list");

    let mut groups = group_by_tract(field.records.clone());
    assert_eq!(groups.len(), 1);
    let (tract, records) = groups.remove(0);
    assert_eq!(tract, 0);

    let mut run = CalibrationRun::new(CalibrationConfig::default()).unwrap();
    assert_eq!(run.add_exposures(&records).unwrap(), 4);
    let summary = run
        .calibrate(&field.reference, &mut store, &tuple_path)
        .unwrap();

    assert_ne!(summary.terminal(), TerminalState::Failed);
    assert!(summary.skipped.is_empty());
    assert!(summary.reference_matches > 50);
    assert!(summary.emission.failed.is_empty());
    assert_eq!(summary.emission.written.len(), 4);
    assert!(tuple_path.exists());

    // Every contaminated or faint detection was caught by selection
    for selection in &summary.selections {
        assert!(selection.stats.kept < selection.stats.input);
    }

    let final_chi2 = summary.convergence.final_chi2().unwrap();
    assert!(final_chi2.reduced() < 3.0, "{final_chi2}");

    for record in &records {
        let id = record.meta.id;
        let truth = field.truth_for(id).unwrap();
        let corrected: CorrectedWcs = store.load(id).unwrap();
        assert_eq!(corrected.id, id);

        let nominal_rms = rms_arcsec(&field, truth, |x, y| record.meta.wcs.pixel_to_sky(x, y));
        let corrected_rms = rms_arcsec(&field, truth, |x, y| corrected.pixel_to_sky(x, y));
        log::info!("Exposure {id}: nominal {nominal_rms:.4}\" corrected {corrected_rms:.4}\"");

        assert!(corrected_rms < 0.05, "exposure {id}: {corrected_rms}\"");
        assert!(corrected_rms < nominal_rms / 3.0);
    }
}

#[test]
fn test_reference_catalog_file_round_trip_drives_calibration() {
    let field = synthetic::generate(&SyntheticConfig {
        seed: 3,
        n_stars: 80,
        n_exposures: 2,
        ..Default::default()
    })
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let ref_path = dir.path().join("reference.json");
    field.reference.save_to_file(&ref_path).unwrap();
    let reference = InMemoryReferenceCatalog::load_from_file(&ref_path).unwrap();
    assert_eq!(reference.len(), field.reference.len());
    assert_relative_eq!(
        reference.entries[0].ra,
        field.reference.entries[0].ra,
        max_relative = 1e-12
    );

    let mut config = CalibrationConfig::default();
    config.association.reference_filter = Some(synthetic::REFERENCE_FILTER.to_string());
    let config_path = dir.path().join("config.json");
    config.save_to_file(&config_path).unwrap();

    let mut run = CalibrationRun::new(CalibrationConfig::load_from_file(&config_path).unwrap())
        .unwrap();
    run.add_exposures(&field.records).unwrap();
    let mut store = JsonTransformStore::new(dir.path().join("wcs")).unwrap();
    let summary = run
        .calibrate(&reference, &mut store, &dir.path().join("res_0.list"))
        .unwrap();

    assert_ne!(summary.terminal(), TerminalState::Failed);
    for id in &summary.emission.written {
        assert!(store.path_for(*id).exists());
    }
}
