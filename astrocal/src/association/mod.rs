//! Cross-exposure association of selected sources.
//!
//! Every selected source becomes a [`MeasuredStar`] of its exposure's
//! [`CcdImage`]. Measurements of the same physical object in different
//! exposures are linked to one [`FittedStar`], whose position in a common
//! tangent plane is a model parameter of the distortion fit. Fitted stars
//! may additionally be tied to a [`ReferenceStar`], which anchors the
//! solution to the absolute frame.
//!
//! Typical sequence:
//!
//! ```text
//! add_image (per exposure) → associate_catalogs → collect_reference_stars
//!     → select_fitted_stars → deproject_fitted_stars
//! ```

pub mod reference;

pub use reference::{InMemoryReferenceCatalog, ReferenceCatalog, ReferenceEntry, ReferenceStar};

use crate::catalog::{ExposureId, ExposureMeta, MeasurementFields, SchemaError, SourceCatalog};
use crate::geometry::{gnomonic_deproject, gnomonic_project, SkyCoord};
use meter_math::{match_within_radius, nearest_within};
use nalgebra::Vector2;
use thiserror::Error;

/// Errors raised while building or matching the associated star set
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssociationError {
    #[error("exposure {0} was already added")]
    DuplicateExposure(ExposureId),

    #[error("no exposures to associate")]
    NoImages,

    #[error("catalogs have not been associated yet")]
    NotAssociated,

    #[error("exposure {0} cannot be projected onto the common tangent plane")]
    Projection(ExposureId),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// One selected source of one exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredStar {
    pub source_id: u64,
    /// Pixel position
    pub x: f64,
    pub y: f64,
    /// Centroid covariance in pixels²
    pub vx: f64,
    pub vy: f64,
    pub vxy: f64,
    pub flux: f64,
    pub mag: f64,
    /// Position in the common tangent plane through the nominal WCS, degrees
    pub tp: Vector2<f64>,
    /// Index of the fitted star this measurement belongs to
    pub fitted: Option<usize>,
    /// Cleared when the measurement is dropped from the fit
    pub valid: bool,
}

/// A selected exposure catalog with its metadata.
#[derive(Debug, Clone)]
pub struct CcdImage {
    pub meta: ExposureMeta,
    pub measured: Vec<MeasuredStar>,
}

impl CcdImage {
    pub fn id(&self) -> ExposureId {
        self.meta.id
    }

    /// Sky position of the bounding-box centre through the nominal WCS.
    pub fn center_sky(&self) -> SkyCoord {
        let (cx, cy) = self.meta.bbox.center();
        self.meta.wcs.pixel_to_sky(cx, cy)
    }

    pub fn valid_count(&self) -> usize {
        self.measured.iter().filter(|m| m.valid).count()
    }
}

/// A physical object seen in one or more exposures.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedStar {
    /// Position in the common tangent plane, degrees
    pub tp: Vector2<f64>,
    /// Sky position, set by [`CatalogAssociator::deproject_fitted_stars`]
    pub sky: Option<SkyCoord>,
    pub mag: f64,
    pub measurement_count: usize,
    /// Index into [`Associations::references`]
    pub reference: Option<usize>,
}

/// A reference star with its tangent-plane projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedReference {
    pub star: ReferenceStar,
    pub tp: Vector2<f64>,
}

/// Links per-exposure catalogs into a common set of fitted stars.
pub trait CatalogAssociator {
    /// Register one exposure's selected sources. Returns the number of measurements added.
    fn add_image(
        &mut self,
        meta: ExposureMeta,
        sources: &SourceCatalog,
        fields: &MeasurementFields,
    ) -> Result<usize, AssociationError>;

    /// Link measurements closer than `match_radius_arcsec` into fitted stars.
    /// Returns the number of fitted stars.
    fn associate_catalogs(&mut self, match_radius_arcsec: f64) -> Result<usize, AssociationError>;

    /// Drop fitted stars with fewer than `min_measurements` measurements and
    /// invalidate their measurements. Returns the number kept.
    fn select_fitted_stars(&mut self, min_measurements: usize) -> usize;

    /// Compute sky positions of the fitted stars.
    fn deproject_fitted_stars(&mut self) -> Result<(), AssociationError>;
}

/// Ties fitted stars to an external reference catalog.
pub trait ReferenceMatcher {
    /// Centre and radius in degrees of a circle covering every exposure.
    fn sky_bounding_circle(&self) -> Option<(SkyCoord, f64)>;

    /// Attach the nearest reference star within `match_radius_arcsec` to each
    /// fitted star. Returns the number of fitted stars with a reference.
    fn collect_reference_stars(
        &mut self,
        references: Vec<ReferenceStar>,
        match_radius_arcsec: f64,
    ) -> Result<usize, AssociationError>;
}

/// The associated measurement set of one calibration run.
#[derive(Debug, Clone, Default)]
pub struct Associations {
    images: Vec<CcdImage>,
    fitted: Vec<FittedStar>,
    references: Vec<ProjectedReference>,
    tangent_point: Option<SkyCoord>,
}

impl Associations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn images(&self) -> &[CcdImage] {
        &self.images
    }

    pub fn fitted_stars(&self) -> &[FittedStar] {
        &self.fitted
    }

    pub fn references(&self) -> &[ProjectedReference] {
        &self.references
    }

    /// Common tangent point, known once catalogs are associated.
    pub fn tangent_point(&self) -> Option<SkyCoord> {
        self.tangent_point
    }

    pub fn measurement_count(&self) -> usize {
        self.images.iter().map(|im| im.measured.len()).sum()
    }

    pub fn valid_measurement_count(&self) -> usize {
        self.images.iter().map(CcdImage::valid_count).sum()
    }

    pub fn referenced_count(&self) -> usize {
        self.fitted.iter().filter(|f| f.reference.is_some()).count()
    }
}

impl CatalogAssociator for Associations {
    fn add_image(
        &mut self,
        meta: ExposureMeta,
        sources: &SourceCatalog,
        fields: &MeasurementFields,
    ) -> Result<usize, AssociationError> {
        if self.images.iter().any(|im| im.id() == meta.id) {
            return Err(AssociationError::DuplicateExposure(meta.id));
        }
        sources.validate()?;
        let keys = fields.resolve(&sources.schema)?;

        let measured: Vec<MeasuredStar> = sources
            .records
            .iter()
            .map(|record| {
                let (vx, vy, vxy) = keys.position_variances(record);
                // Zero shape moments leave the cross term undefined
                let vxy = if vxy.is_nan() { 0.0 } else { vxy };
                let flux = record.get(keys.flux);
                let (mag, _) = meta.calib.magnitude(flux, record.get(keys.flux_sigma));
                MeasuredStar {
                    source_id: record.id,
                    x: record.get(keys.x),
                    y: record.get(keys.y),
                    vx,
                    vy,
                    vxy,
                    flux,
                    mag,
                    tp: Vector2::zeros(),
                    fitted: None,
                    valid: true,
                }
            })
            .collect();

        let count = measured.len();
        log::debug!("Added exposure {} with {} measurements", meta.id, count);
        self.images.push(CcdImage { meta, measured });
        Ok(count)
    }

    fn associate_catalogs(&mut self, match_radius_arcsec: f64) -> Result<usize, AssociationError> {
        let centers: Vec<SkyCoord> = self.images.iter().map(CcdImage::center_sky).collect();
        let tangent_point = SkyCoord::mean_of(&centers).ok_or(AssociationError::NoImages)?;
        let radius = match_radius_arcsec / 3600.0;

        self.tangent_point = Some(tangent_point);
        self.fitted.clear();
        self.references.clear();

        for image in &mut self.images {
            let id = image.meta.id;
            for m in &mut image.measured {
                let sky = image.meta.wcs.pixel_to_sky(m.x, m.y);
                m.tp = gnomonic_project(&sky, &tangent_point)
                    .ok_or(AssociationError::Projection(id))?;
                m.fitted = None;
                m.valid = true;
            }

            // Match against the fitted stars known before this exposure, so an
            // exposure never contributes two measurements to one fitted star.
            let known: Vec<Vector2<f64>> = self.fitted.iter().map(|f| f.tp).collect();
            let points: Vec<Vector2<f64>> = image.measured.iter().map(|m| m.tp).collect();
            let candidates = match_within_radius(&points, &known, radius);

            let mut claimed: Vec<Option<(usize, f64)>> = vec![None; known.len()];
            for (i, candidate) in candidates.iter().enumerate() {
                if let Some(k) = *candidate {
                    let dist = (points[i] - known[k]).norm();
                    match claimed[k] {
                        Some((_, d)) if d <= dist => {}
                        _ => claimed[k] = Some((i, dist)),
                    }
                }
            }

            for (i, m) in image.measured.iter_mut().enumerate() {
                let owner = candidates[i].filter(|&k| matches!(claimed[k], Some((j, _)) if j == i));
                match owner {
                    Some(k) => {
                        let f = &mut self.fitted[k];
                        let n = f.measurement_count as f64;
                        f.tp = (f.tp * n + m.tp) / (n + 1.0);
                        f.mag = (f.mag * n + m.mag) / (n + 1.0);
                        f.measurement_count += 1;
                        m.fitted = Some(k);
                    }
                    None => {
                        m.fitted = Some(self.fitted.len());
                        self.fitted.push(FittedStar {
                            tp: m.tp,
                            sky: None,
                            mag: m.mag,
                            measurement_count: 1,
                            reference: None,
                        });
                    }
                }
            }
        }

        log::info!(
            "Associated {} measurements from {} exposures into {} fitted stars",
            self.measurement_count(),
            self.images.len(),
            self.fitted.len()
        );
        Ok(self.fitted.len())
    }

    fn select_fitted_stars(&mut self, min_measurements: usize) -> usize {
        let keep: Vec<bool> = self
            .fitted
            .iter()
            .map(|f| {
                f.measurement_count >= min_measurements
                    || (f.reference.is_some() && f.measurement_count >= 1)
            })
            .collect();

        let mut remap = vec![None; self.fitted.len()];
        let mut next = 0;
        for (old, &k) in keep.iter().enumerate() {
            if k {
                remap[old] = Some(next);
                next += 1;
            }
        }

        let mut idx = 0;
        self.fitted.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });

        let mut dropped = 0;
        for image in &mut self.images {
            for m in &mut image.measured {
                m.fitted = m.fitted.and_then(|k| remap[k]);
                if m.fitted.is_none() && m.valid {
                    m.valid = false;
                    dropped += 1;
                }
            }
        }

        log::info!(
            "Kept {} fitted stars with at least {} measurements, dropped {} measurements",
            self.fitted.len(),
            min_measurements,
            dropped
        );
        self.fitted.len()
    }

    fn deproject_fitted_stars(&mut self) -> Result<(), AssociationError> {
        let tangent_point = self.tangent_point.ok_or(AssociationError::NotAssociated)?;
        for f in &mut self.fitted {
            f.sky = Some(gnomonic_deproject(&f.tp, &tangent_point));
        }
        Ok(())
    }
}

impl ReferenceMatcher for Associations {
    fn sky_bounding_circle(&self) -> Option<(SkyCoord, f64)> {
        let centers: Vec<SkyCoord> = self.images.iter().map(CcdImage::center_sky).collect();
        let center = self.tangent_point.or_else(|| SkyCoord::mean_of(&centers))?;

        let radius = self
            .images
            .iter()
            .flat_map(|im| {
                im.meta
                    .bbox
                    .corners()
                    .into_iter()
                    .map(|(x, y)| im.meta.wcs.pixel_to_sky(x, y).separation(&center))
            })
            .fold(0.0, f64::max);
        Some((center, radius))
    }

    fn collect_reference_stars(
        &mut self,
        references: Vec<ReferenceStar>,
        match_radius_arcsec: f64,
    ) -> Result<usize, AssociationError> {
        let tangent_point = self.tangent_point.ok_or(AssociationError::NotAssociated)?;
        let radius = match_radius_arcsec / 3600.0;

        self.references = references
            .into_iter()
            .filter_map(|star| {
                gnomonic_project(&star.sky, &tangent_point).map(|tp| ProjectedReference { star, tp })
            })
            .collect();
        let ref_points: Vec<Vector2<f64>> = self.references.iter().map(|r| r.tp).collect();

        // A reference star goes to the closest fitted star that picked it.
        let mut best: Vec<Option<(usize, f64)>> = vec![None; ref_points.len()];
        for (k, f) in self.fitted.iter().enumerate() {
            if let Some((r, dist)) = nearest_within(&f.tp, &ref_points, radius) {
                match best[r] {
                    Some((_, d)) if d <= dist => {}
                    _ => best[r] = Some((k, dist)),
                }
            }
        }

        for f in &mut self.fitted {
            f.reference = None;
        }
        for (r, owner) in best.iter().enumerate() {
            if let Some((k, _)) = owner {
                self.fitted[*k].reference = Some(r);
            }
        }

        let matched = self.referenced_count();
        log::info!(
            "Matched {} of {} fitted stars to {} reference stars",
            matched,
            self.fitted.len(),
            self.references.len()
        );
        Ok(matched)
    }
}
