//! Polynomial pixel → sky transform produced by the fit.
//!
//! Pixel coordinates are first normalised to roughly [-1, 1] over the
//! exposure's bounding box,
//!
//! ```text
//! u = (x - center_x) / half_size_x
//! v = (y - center_y) / half_size_y
//! ```
//!
//! then mapped by two polynomials of a [`PolyBasis2d`] onto the tangent
//! plane at `tangent_point` (degrees), and deprojected to the sky.

use crate::catalog::ExposureId;
use crate::geometry::{gnomonic_deproject, gnomonic_project, BoundingBox, SkyCoord, TanWcs};
use meter_math::{LinearSolveError, NormalEquations, PolyBasis2d};
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Grid points per axis used to fit a mapping to a nominal WCS.
const INIT_GRID: usize = 10;

/// Fitted astrometric solution of one exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectedWcs {
    pub id: ExposureId,
    pub tangent_point: SkyCoord,
    pub center: [f64; 2],
    pub half_size: [f64; 2],
    pub degree: usize,
    /// ξ coefficients in [`PolyBasis2d`] order, degrees
    pub coeffs_x: Vec<f64>,
    /// η coefficients in [`PolyBasis2d`] order, degrees
    pub coeffs_y: Vec<f64>,
}

impl CorrectedWcs {
    /// Fit a polynomial mapping reproducing `wcs` over `bbox`, relative to `tangent_point`.
    pub fn from_tan_wcs(
        id: ExposureId,
        wcs: &TanWcs,
        bbox: &BoundingBox,
        tangent_point: SkyCoord,
        degree: usize,
    ) -> Result<Self, LinearSolveError> {
        let (cx, cy) = bbox.center();
        let basis = PolyBasis2d::new(degree);
        let mut out = Self {
            id,
            tangent_point,
            center: [cx, cy],
            half_size: [(0.5 * bbox.width()).max(1.0), (0.5 * bbox.height()).max(1.0)],
            degree,
            coeffs_x: vec![0.0; basis.num_terms()],
            coeffs_y: vec![0.0; basis.num_terms()],
        };

        let n = basis.num_terms();
        let indices: Vec<usize> = (0..n).collect();
        let mut ne_x = NormalEquations::new(n);
        let mut ne_y = NormalEquations::new(n);

        for i in 0..INIT_GRID {
            for j in 0..INIT_GRID {
                let fx = i as f64 / (INIT_GRID - 1) as f64;
                let fy = j as f64 / (INIT_GRID - 1) as f64;
                let x = bbox.min_x + fx * bbox.width();
                let y = bbox.min_y + fy * bbox.height();
                let Some(tp) = gnomonic_project(&wcs.pixel_to_sky(x, y), &tangent_point) else {
                    continue;
                };
                let (u, v) = out.normalize(x, y);
                let terms = basis.terms(u, v);
                ne_x.add_residual(&indices, &terms, -tp.x, 1.0);
                ne_y.add_residual(&indices, &terms, -tp.y, 1.0);
            }
        }

        out.coeffs_x = ne_x.solve()?.iter().copied().collect();
        out.coeffs_y = ne_y.solve()?.iter().copied().collect();
        Ok(out)
    }

    pub fn basis(&self) -> PolyBasis2d {
        PolyBasis2d::new(self.degree)
    }

    /// Normalised (u, v) of a pixel.
    #[inline]
    pub fn normalize(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.center[0]) / self.half_size[0],
            (y - self.center[1]) / self.half_size[1],
        )
    }

    /// Tangent-plane position (degrees) of a pixel.
    pub fn pixel_to_tangent_plane(&self, x: f64, y: f64) -> Vector2<f64> {
        let basis = self.basis();
        let (u, v) = self.normalize(x, y);
        Vector2::new(
            basis.evaluate(&self.coeffs_x, u, v),
            basis.evaluate(&self.coeffs_y, u, v),
        )
    }

    pub fn pixel_to_sky(&self, x: f64, y: f64) -> SkyCoord {
        gnomonic_deproject(&self.pixel_to_tangent_plane(x, y), &self.tangent_point)
    }

    /// Derivative of the tangent-plane position with respect to pixel position.
    pub fn pixel_jacobian(&self, x: f64, y: f64) -> Matrix2<f64> {
        let basis = self.basis();
        let (u, v) = self.normalize(x, y);
        let (dxi_du, dxi_dv) = basis.gradient(&self.coeffs_x, u, v);
        let (deta_du, deta_dv) = basis.gradient(&self.coeffs_y, u, v);
        let (sx, sy) = (1.0 / self.half_size[0], 1.0 / self.half_size[1]);
        Matrix2::new(dxi_du * sx, dxi_dv * sy, deta_du * sx, deta_dv * sy)
    }

    /// Save transform to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Load transform from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn setup() -> (TanWcs, BoundingBox, SkyCoord) {
        let crval = SkyCoord::new(150.1, 2.05);
        let wcs = TanWcs::from_scale([1024.0, 2048.0], crval, 0.2, 3.0);
        let bbox = BoundingBox::from_size(2048, 4096);
        (wcs, bbox, SkyCoord::new(150.0, 2.0))
    }

    #[test]
    fn test_reproduces_nominal_wcs() {
        let (wcs, bbox, tp) = setup();
        let corrected = CorrectedWcs::from_tan_wcs(ExposureId::new(1, 2), &wcs, &bbox, tp, 3).unwrap();

        for &(x, y) in &[(0.0, 0.0), (1500.0, 300.0), (2047.0, 4095.0), (700.0, 3333.0)] {
            let sep = corrected.pixel_to_sky(x, y).separation(&wcs.pixel_to_sky(x, y));
            assert!(sep * 3600.0 < 1e-3, "separation {} arcsec at ({x}, {y})", sep * 3600.0);
        }
    }

    #[test]
    fn test_jacobian_matches_pixel_scale() {
        let (wcs, bbox, tp) = setup();
        let corrected = CorrectedWcs::from_tan_wcs(ExposureId::new(1, 2), &wcs, &bbox, tp, 2).unwrap();
        let jac = corrected.pixel_jacobian(1024.0, 2048.0);
        assert_relative_eq!(jac.determinant().abs().sqrt() * 3600.0, 0.2, max_relative = 1e-4);
    }

    #[test]
    fn test_json_round_trip() {
        let (wcs, bbox, tp) = setup();
        let corrected = CorrectedWcs::from_tan_wcs(ExposureId::new(5, 6), &wcs, &bbox, tp, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wcs.json");
        corrected.save_to_file(&path).unwrap();
        let loaded = CorrectedWcs::load_from_file(&path).unwrap();
        assert_eq!(loaded.id, corrected.id);
        assert_eq!(loaded.degree, corrected.degree);
        for (a, b) in loaded.coeffs_x.iter().zip(&corrected.coeffs_x) {
            assert_relative_eq!(*a, *b, max_relative = 1e-14);
        }
    }
}
