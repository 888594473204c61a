//! Jointly calibrate the astrometry of every tract in an exposure bundle.
//!
//! The input bundle is a JSON array of exposure records (metadata plus source
//! catalog), the reference catalog a JSON [`InMemoryReferenceCatalog`]. For
//! each tract the tool writes `wcs_<visit>_<ccd>.json` per exposure and a
//! residual tuple `res_<tract>.list` into the output directory.
//!
//! With `--synthetic` a generated field replaces both inputs, which is handy
//! for checking an installation or tuning configuration.

use anyhow::{bail, Context, Result};
use astrocal::synthetic::{self, SyntheticConfig};
use astrocal::{
    group_by_tract, CalibrationConfig, CalibrationError, CalibrationRun, ExposureRecord,
    InMemoryReferenceCatalog, JsonTransformStore, RunSummary,
};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Joint astrometric calibration per tract", long_about = None)]
struct Args {
    /// JSON array of exposure records
    #[arg(short, long, required_unless_present = "synthetic")]
    input: Option<PathBuf>,

    /// Reference catalog JSON
    #[arg(short, long, required_unless_present = "synthetic")]
    reference: Option<PathBuf>,

    /// Calibration configuration JSON (defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory receiving transforms and residual tuples
    #[arg(short, long, default_value = "calibration_output")]
    output_dir: PathBuf,

    /// Only calibrate this tract
    #[arg(short, long)]
    tract: Option<u32>,

    /// Calibrate a synthetic field generated from this seed instead of reading inputs
    #[arg(long, conflicts_with_all = ["input", "reference"])]
    synthetic: Option<u64>,

    /// Write the run configuration actually used to this path
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

fn load_bundle(path: &Path) -> Result<Vec<ExposureRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing exposure bundle {}", path.display()))
}

fn report(tract: u32, summary: &RunSummary) {
    let chi2 = summary
        .convergence
        .final_chi2()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "n/a".to_string());
    println!("Tract {tract}: {}", summary.terminal());
    println!("  exposures selected : {}", summary.selections.len());
    println!("  exposures skipped  : {}", summary.skipped.len());
    println!("  fitted stars       : {}", summary.fitted_stars);
    println!("  reference matches  : {}", summary.reference_matches);
    println!("  iterations         : {}", summary.convergence.iterations_run());
    println!("  final              : {chi2}");
    println!(
        "  transforms written : {} ({} failed)",
        summary.emission.written.len(),
        summary.emission.failed.len()
    );
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CalibrationConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CalibrationConfig::default(),
    };
    if let Some(path) = &args.dump_config {
        config
            .save_to_file(path)
            .with_context(|| format!("writing config {}", path.display()))?;
    }

    let (records, refcat) = match args.synthetic {
        Some(seed) => {
            let field = synthetic::generate(&SyntheticConfig {
                seed,
                ..Default::default()
            })?;
            (field.records, field.reference)
        }
        None => {
            let (Some(input), Some(reference)) = (&args.input, &args.reference) else {
                bail!("--input and --reference are required without --synthetic");
            };
            let refcat = InMemoryReferenceCatalog::load_from_file(reference)
                .with_context(|| format!("loading reference catalog {}", reference.display()))?;
            (load_bundle(input)?, refcat)
        }
    };

    let mut store = JsonTransformStore::new(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    let mut failures = 0;
    let mut ran = 0;
    for (tract, group) in group_by_tract(records) {
        if args.tract.is_some_and(|t| t != tract) {
            continue;
        }
        ran += 1;
        log::info!("Calibrating tract {tract} with {} exposures", group.len());

        let mut run = CalibrationRun::new(config.clone())?;
        run.add_exposures(&group)
            .with_context(|| format!("selecting sources of tract {tract}"))?;

        let tuple_path = args.output_dir.join(format!("res_{tract}.list"));
        match run.calibrate(&refcat, &mut store, &tuple_path) {
            Ok(summary) => report(tract, &summary),
            Err(CalibrationError::MinimizationFailed { summary }) => {
                report(tract, &summary);
                log::error!("Tract {tract}: minimization failed, transforms are not valid");
                failures += 1;
            }
            Err(e) => {
                log::error!("Tract {tract}: {e}");
                failures += 1;
            }
        }
    }

    if ran == 0 {
        bail!("no exposures to calibrate");
    }
    if failures > 0 {
        bail!("{failures} of {ran} tracts failed to calibrate");
    }
    Ok(())
}
