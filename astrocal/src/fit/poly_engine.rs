//! Polynomial distortion fit over associated measurements.
//!
//! # Model
//!
//! Each exposure `i` maps pixels to the common tangent plane through a full
//! 2D polynomial `P_i` (see [`CorrectedWcs`]). Each fitted star `k` has a
//! tangent-plane position `F_k`. Two kinds of residual terms constrain them:
//!
//! ```text
//! measurement:  r = P_i(x, y) - F_k     W = (J Σ Jᵀ)⁻¹
//! reference:    r = F_k - R_k           W = I / σ_ref²
//! ```
//!
//! where `J = ∂P_i/∂(x, y)` and `Σ` is the centroid covariance with the
//! configured position error floor added to its diagonal. `J` is evaluated
//! once per step, so every step is a linear least-squares problem solved
//! exactly through the normal equations.
//!
//! # Parameters
//!
//! Which parameters are free depends on the [`FitStage`]. An exposure's
//! mapping is only fitted when it has at least as many valid measurements as
//! its polynomial has terms; a star position is only fitted when at least one
//! valid term constrains it. Everything else is held at its current value.
//!
//! # Outlier rejection
//!
//! With a rejection threshold, [`PolyFitEngine::minimize`] alternates steps
//! with clipping at `mean + n·σ` of the per-term chi2 distribution, removing
//! at most one term per fitted star per pass so that a single bad
//! measurement does not drag its companions out with it.

use super::{Chi2, CorrectedWcs, DistortionFitEngine, EngineError, FitStage, MinimizeOutcome};
use crate::association::Associations;
use crate::catalog::ExposureId;
use meter_math::{LinearSolveError, NormalEquations, PolyBasis2d, SigmaClip};
use nalgebra::{DVector, Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEG_TO_MAS: f64 = 3.6e6;

/// Parameters of the polynomial fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Degree of the per-exposure pixel → tangent plane polynomial
    pub degree: usize,
    /// Systematic centroid error added in quadrature, pixels
    pub position_error_px: f64,
    /// Smallest reference position error used for weighting, arcseconds
    pub min_reference_error_arcsec: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            degree: 3,
            position_error_px: 0.02,
            min_reference_error_arcsec: 0.001,
        }
    }
}

#[derive(Debug, Clone)]
struct ImageModel {
    id: ExposureId,
    mapping: CorrectedWcs,
}

#[derive(Debug, Clone)]
struct Measurement {
    image: usize,
    star: usize,
    source_id: u64,
    x: f64,
    y: f64,
    vx: f64,
    vy: f64,
    vxy: f64,
    valid: bool,
}

#[derive(Debug, Clone)]
struct ReferenceTerm {
    star: usize,
    reference_id: u64,
    tp: Vector2<f64>,
    /// Position error, degrees
    sigma: f64,
    valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    Measurement(usize),
    Reference(usize),
}

/// Offsets of the free parameters of one stage in the solution vector.
struct ParameterLayout {
    images: Vec<Option<usize>>,
    stars: Vec<Option<usize>>,
    len: usize,
}

/// Reference [`DistortionFitEngine`] with one polynomial per exposure.
#[derive(Debug, Clone)]
pub struct PolyFitEngine {
    config: EngineConfig,
    basis: PolyBasis2d,
    images: Vec<ImageModel>,
    stars: Vec<Vector2<f64>>,
    measurements: Vec<Measurement>,
    references: Vec<ReferenceTerm>,
    outliers_removed: usize,
}

impl PolyFitEngine {
    /// Build the fit from associated catalogs.
    ///
    /// Mappings start from each exposure's nominal WCS and star positions
    /// from their associated tangent-plane positions. Invalid measurements
    /// are left out.
    ///
    /// # Errors
    /// * [`EngineError::NotAssociated`] if the catalogs have no tangent point yet
    /// * [`EngineError::Initialization`] if a nominal WCS cannot be represented
    /// * [`EngineError::NoData`] if no valid measurement remains
    pub fn new(associations: &Associations, config: &EngineConfig) -> Result<Self, EngineError> {
        let tangent_point = associations
            .tangent_point()
            .ok_or(EngineError::NotAssociated)?;
        let basis = PolyBasis2d::new(config.degree);

        let mut images = Vec::with_capacity(associations.images().len());
        let mut measurements = Vec::new();
        for (i, image) in associations.images().iter().enumerate() {
            let id = image.id();
            let mapping = CorrectedWcs::from_tan_wcs(
                id,
                &image.meta.wcs,
                &image.meta.bbox,
                tangent_point,
                config.degree,
            )
            .map_err(|source| EngineError::Initialization { id, source })?;
            images.push(ImageModel { id, mapping });

            for m in image.measured.iter().filter(|m| m.valid) {
                let Some(star) = m.fitted else { continue };
                measurements.push(Measurement {
                    image: i,
                    star,
                    source_id: m.source_id,
                    x: m.x,
                    y: m.y,
                    vx: m.vx,
                    vy: m.vy,
                    vxy: m.vxy,
                    valid: true,
                });
            }
        }
        if measurements.is_empty() {
            return Err(EngineError::NoData);
        }

        let stars: Vec<Vector2<f64>> = associations.fitted_stars().iter().map(|f| f.tp).collect();
        let references: Vec<ReferenceTerm> = associations
            .fitted_stars()
            .iter()
            .enumerate()
            .filter_map(|(k, f)| {
                let r = &associations.references()[f.reference?];
                let sigma = r
                    .star
                    .position_error_arcsec
                    .max(config.min_reference_error_arcsec)
                    / 3600.0;
                Some(ReferenceTerm {
                    star: k,
                    reference_id: r.star.id,
                    tp: r.tp,
                    sigma,
                    valid: true,
                })
            })
            .collect();

        log::info!(
            "Fit set up with {} exposures, {} fitted stars, {} measurements, {} reference terms, degree {}",
            images.len(),
            stars.len(),
            measurements.len(),
            references.len(),
            config.degree
        );

        Ok(Self {
            config: config.clone(),
            basis,
            images,
            stars,
            measurements,
            references,
            outliers_removed: 0,
        })
    }

    /// Terms removed by outlier rejection so far.
    pub fn outliers_removed(&self) -> usize {
        self.outliers_removed
    }

    fn layout(&self, stage: FitStage) -> ParameterLayout {
        let nt = self.basis.num_terms();
        let mut per_image = vec![0usize; self.images.len()];
        let mut per_star = vec![0usize; self.stars.len()];
        for m in self.measurements.iter().filter(|m| m.valid) {
            per_image[m.image] += 1;
            per_star[m.star] += 1;
        }
        for r in self.references.iter().filter(|r| r.valid) {
            per_star[r.star] += 1;
        }

        let mut len = 0;
        let images = per_image
            .iter()
            .map(|&count| {
                (stage.fits_distortions() && count >= nt).then(|| {
                    let first = len;
                    len += 2 * nt;
                    first
                })
            })
            .collect();
        let stars = per_star
            .iter()
            .map(|&count| {
                (stage.fits_positions() && count > 0).then(|| {
                    let first = len;
                    len += 2;
                    first
                })
            })
            .collect();

        ParameterLayout { images, stars, len }
    }

    fn measurement_residual(&self, m: &Measurement) -> Vector2<f64> {
        self.images[m.image].mapping.pixel_to_tangent_plane(m.x, m.y) - self.stars[m.star]
    }

    fn measurement_weight(&self, m: &Measurement) -> Option<Matrix2<f64>> {
        let jac = self.images[m.image].mapping.pixel_jacobian(m.x, m.y);
        let pe2 = self.config.position_error_px * self.config.position_error_px;
        let cov = Matrix2::new(m.vx + pe2, m.vxy, m.vxy, m.vy + pe2);
        (jac * cov * jac.transpose()).try_inverse()
    }

    fn reference_residual(&self, r: &ReferenceTerm) -> Vector2<f64> {
        self.stars[r.star] - r.tp
    }

    fn term_chi2(&self, term: Term) -> f64 {
        match term {
            Term::Measurement(j) => {
                let m = &self.measurements[j];
                match self.measurement_weight(m) {
                    Some(w) => {
                        let r = self.measurement_residual(m);
                        r.dot(&(w * r))
                    }
                    None => 0.0,
                }
            }
            Term::Reference(j) => {
                let r = &self.references[j];
                self.reference_residual(r).norm_squared() / (r.sigma * r.sigma)
            }
        }
    }

    fn valid_terms(&self) -> impl Iterator<Item = Term> + '_ {
        let measurements = self
            .measurements
            .iter()
            .enumerate()
            .filter(|(_, m)| m.valid)
            .map(|(j, _)| Term::Measurement(j));
        let references = self
            .references
            .iter()
            .enumerate()
            .filter(|(_, r)| r.valid)
            .map(|(j, _)| Term::Reference(j));
        measurements.chain(references)
    }

    fn term_star(&self, term: Term) -> usize {
        match term {
            Term::Measurement(j) => self.measurements[j].star,
            Term::Reference(j) => self.references[j].star,
        }
    }

    fn normal_equations(&self, layout: &ParameterLayout) -> NormalEquations {
        let nt = self.basis.num_terms();
        let mut ne = NormalEquations::new(layout.len);
        let mut indices = Vec::with_capacity(2 * nt + 2);
        let mut jac_x = Vec::with_capacity(2 * nt + 2);
        let mut jac_y = Vec::with_capacity(2 * nt + 2);

        for m in self.measurements.iter().filter(|m| m.valid) {
            let image_param = layout.images[m.image];
            let star_param = layout.stars[m.star];
            if image_param.is_none() && star_param.is_none() {
                continue;
            }
            let Some(weight) = self.measurement_weight(m) else {
                continue;
            };

            indices.clear();
            jac_x.clear();
            jac_y.clear();

            if let Some(first) = image_param {
                let (u, v) = self.images[m.image].mapping.normalize(m.x, m.y);
                let terms = self.basis.terms(u, v);
                for (t, &value) in terms.iter().enumerate() {
                    indices.push(first + t);
                    jac_x.push(value);
                    jac_y.push(0.0);
                }
                for (t, &value) in terms.iter().enumerate() {
                    indices.push(first + nt + t);
                    jac_x.push(0.0);
                    jac_y.push(value);
                }
            }
            if let Some(first) = star_param {
                indices.extend([first, first + 1]);
                jac_x.extend([-1.0, 0.0]);
                jac_y.extend([0.0, -1.0]);
            }

            let residual = self.measurement_residual(m);
            ne.add_residual2(&indices, &jac_x, &jac_y, &residual, &weight);
        }

        for r in self.references.iter().filter(|r| r.valid) {
            let Some(first) = layout.stars[r.star] else {
                continue;
            };
            let weight = Matrix2::identity() / (r.sigma * r.sigma);
            let residual = self.reference_residual(r);
            ne.add_residual2(&[first, first + 1], &[1.0, 0.0], &[0.0, 1.0], &residual, &weight);
        }

        ne
    }

    fn apply(&mut self, layout: &ParameterLayout, delta: &DVector<f64>) {
        let nt = self.basis.num_terms();
        for (image, first) in self.images.iter_mut().zip(&layout.images) {
            if let Some(first) = *first {
                for t in 0..nt {
                    image.mapping.coeffs_x[t] += delta[first + t];
                    image.mapping.coeffs_y[t] += delta[first + nt + t];
                }
            }
        }
        for (star, first) in self.stars.iter_mut().zip(&layout.stars) {
            if let Some(first) = *first {
                star.x += delta[first];
                star.y += delta[first + 1];
            }
        }
    }

    /// One linear least-squares step on the parameters of `stage`.
    fn step(&mut self, stage: FitStage) -> Result<(), LinearSolveError> {
        let layout = self.layout(stage);
        let delta = self.normal_equations(&layout).solve()?;
        self.apply(&layout, &delta);
        Ok(())
    }

    /// Terms above the clipping threshold, at most one per fitted star.
    fn find_outliers(&self, n_sigma: f64) -> Vec<Term> {
        let mut contributions: Vec<(f64, Term)> = self
            .valid_terms()
            .map(|term| (self.term_chi2(term), term))
            .collect();
        let values: Vec<f64> = contributions.iter().map(|(c, _)| *c).collect();
        let Some(clip) = SigmaClip::from_sample(&values, n_sigma) else {
            return Vec::new();
        };

        contributions.sort_by(|a, b| b.0.total_cmp(&a.0));
        let mut touched = vec![false; self.stars.len()];
        let mut outliers = Vec::new();
        for (chi2, term) in contributions {
            if !clip.is_outlier(chi2) {
                break;
            }
            let star = self.term_star(term);
            if touched[star] {
                continue;
            }
            touched[star] = true;
            outliers.push(term);
        }

        log::debug!(
            "Outlier threshold {:.3} (mean {:.3}, sigma {:.3}): {} outliers",
            clip.threshold(),
            clip.mean,
            clip.sigma,
            outliers.len()
        );
        outliers
    }

    fn remove(&mut self, terms: &[Term]) {
        for &term in terms {
            match term {
                Term::Measurement(j) => self.measurements[j].valid = false,
                Term::Reference(j) => self.references[j].valid = false,
            }
        }
        self.outliers_removed += terms.len();
    }
}

#[derive(Debug, Serialize)]
struct ResidualRow {
    kind: &'static str,
    visit: Option<u32>,
    ccd: Option<u32>,
    source_id: u64,
    star: usize,
    x: Option<f64>,
    y: Option<f64>,
    xi_residual_mas: f64,
    eta_residual_mas: f64,
    chi2: f64,
    valid: bool,
}

impl DistortionFitEngine for PolyFitEngine {
    fn minimize(&mut self, stage: FitStage, rejection_sigma: Option<f64>) -> MinimizeOutcome {
        let mut previous_chi2: Option<f64> = None;
        let mut removed = 0;

        loop {
            if let Err(e) = self.step(stage) {
                log::warn!("{stage} minimization failed: {e}");
                return MinimizeOutcome::Failed;
            }
            let chi2 = self.compute_chi2();
            if !chi2.chi2.is_finite() {
                log::warn!("{stage} minimization produced a non-finite chi2");
                return MinimizeOutcome::Failed;
            }

            let Some(n_sigma) = rejection_sigma else {
                return MinimizeOutcome::Converged;
            };

            if let Some(previous) = previous_chi2 {
                if removed > 0 && chi2.chi2 > previous {
                    log::warn!(
                        "chi2 increased from {previous:.3} to {:.3} after removing {removed} outliers",
                        chi2.chi2
                    );
                    return MinimizeOutcome::OutliersRemainButChi2Increased;
                }
            }
            previous_chi2 = Some(chi2.chi2);

            let outliers = self.find_outliers(n_sigma);
            if outliers.is_empty() {
                log::debug!("{stage} converged after removing {removed} outliers, {chi2}");
                return MinimizeOutcome::Converged;
            }
            removed += outliers.len();
            self.remove(&outliers);
        }
    }

    fn compute_chi2(&self) -> Chi2 {
        let mut chi2 = 0.0;
        let mut terms: usize = 0;
        for term in self.valid_terms() {
            chi2 += self.term_chi2(term);
            terms += 1;
        }
        let free = self.layout(FitStage::DistortionsAndPositions).len;
        Chi2 {
            chi2,
            ndof: (2 * terms).saturating_sub(free),
        }
    }

    fn exposures(&self) -> Vec<ExposureId> {
        self.images.iter().map(|im| im.id).collect()
    }

    fn produce_corrected_transform(&self, id: ExposureId) -> Result<CorrectedWcs, EngineError> {
        self.images
            .iter()
            .find(|im| im.id == id)
            .map(|im| im.mapping.clone())
            .ok_or(EngineError::UnknownExposure(id))
    }

    fn write_residual_tuple(&self, path: &Path) -> Result<(), EngineError> {
        let mut writer = csv::Writer::from_path(path)?;

        for (j, m) in self.measurements.iter().enumerate() {
            let r = self.measurement_residual(m);
            let id = self.images[m.image].id;
            writer.serialize(ResidualRow {
                kind: "measurement",
                visit: Some(id.visit),
                ccd: Some(id.ccd),
                source_id: m.source_id,
                star: m.star,
                x: Some(m.x),
                y: Some(m.y),
                xi_residual_mas: r.x * DEG_TO_MAS,
                eta_residual_mas: r.y * DEG_TO_MAS,
                chi2: self.term_chi2(Term::Measurement(j)),
                valid: m.valid,
            })?;
        }

        for (j, rt) in self.references.iter().enumerate() {
            let r = self.reference_residual(rt);
            writer.serialize(ResidualRow {
                kind: "reference",
                visit: None,
                ccd: None,
                source_id: rt.reference_id,
                star: rt.star,
                x: None,
                y: None,
                xi_residual_mas: r.x * DEG_TO_MAS,
                eta_residual_mas: r.y * DEG_TO_MAS,
                chi2: self.term_chi2(Term::Reference(j)),
                valid: rt.valid,
            })?;
        }

        writer.flush()?;
        log::info!("Wrote residual tuple to {}", path.display());
        Ok(())
    }
}
