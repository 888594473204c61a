//! Sky coordinates, gnomonic tangent-plane projection and the nominal TAN WCS.
//!
//! All angles crossing this module's API are in degrees. Tangent-plane
//! coordinates (ξ, η) are also expressed in degrees.

use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// A position on the celestial sphere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    /// Right ascension in degrees, [0, 360)
    pub ra: f64,
    /// Declination in degrees, [-90, 90]
    pub dec: f64,
}

impl SkyCoord {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self {
            ra: ra.rem_euclid(360.0),
            dec,
        }
    }

    /// Unit vector in the equatorial frame.
    pub fn to_unit_vector(&self) -> Vector3<f64> {
        let (ra, dec) = (self.ra.to_radians(), self.dec.to_radians());
        Vector3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
    }

    /// Inverse of [`Self::to_unit_vector`]; the input need not be normalised.
    pub fn from_vector(v: &Vector3<f64>) -> Self {
        let n = v.normalize();
        let dec = n.z.clamp(-1.0, 1.0).asin().to_degrees();
        let ra = n.y.atan2(n.x).to_degrees();
        Self::new(ra, dec)
    }

    /// Great-circle separation in degrees.
    pub fn separation(&self, other: &SkyCoord) -> f64 {
        let a = self.to_unit_vector();
        let b = other.to_unit_vector();
        // atan2 of cross/dot is accurate at both small and large separations
        a.cross(&b).norm().atan2(a.dot(&b)).to_degrees()
    }

    /// Normalised mean direction of a set of positions.
    pub fn mean_of(coords: &[SkyCoord]) -> Option<SkyCoord> {
        if coords.is_empty() {
            return None;
        }
        let sum = coords
            .iter()
            .fold(Vector3::zeros(), |acc, c| acc + c.to_unit_vector());
        if sum.norm() < f64::EPSILON {
            return None;
        }
        Some(Self::from_vector(&sum))
    }
}

/// Gnomonic projection of `sky` onto the plane tangent at `tangent_point`.
///
/// Returns (ξ, η) in degrees, or `None` when the point is 90° or more from
/// the tangent point.
pub fn gnomonic_project(sky: &SkyCoord, tangent_point: &SkyCoord) -> Option<Vector2<f64>> {
    let (ra, dec) = (sky.ra.to_radians(), sky.dec.to_radians());
    let (ra0, dec0) = (tangent_point.ra.to_radians(), tangent_point.dec.to_radians());
    let dra = ra - ra0;

    let cos_c = dec0.sin() * dec.sin() + dec0.cos() * dec.cos() * dra.cos();
    if cos_c <= 0.0 {
        return None;
    }

    let xi = dec.cos() * dra.sin() / cos_c;
    let eta = (dec0.cos() * dec.sin() - dec0.sin() * dec.cos() * dra.cos()) / cos_c;
    Some(Vector2::new(xi.to_degrees(), eta.to_degrees()))
}

/// Inverse of [`gnomonic_project`].
pub fn gnomonic_deproject(tp: &Vector2<f64>, tangent_point: &SkyCoord) -> SkyCoord {
    let xi = tp.x.to_radians();
    let eta = tp.y.to_radians();
    let (ra0, dec0) = (tangent_point.ra.to_radians(), tangent_point.dec.to_radians());

    let rho = (xi * xi + eta * eta).sqrt();
    if rho == 0.0 {
        return *tangent_point;
    }
    let c = rho.atan();
    let (sin_c, cos_c) = c.sin_cos();

    let dec = (cos_c * dec0.sin() + eta * sin_c * dec0.cos() / rho).asin();
    let ra = ra0 + (xi * sin_c).atan2(rho * dec0.cos() * cos_c - eta * dec0.sin() * sin_c);
    SkyCoord::new(ra.to_degrees(), dec.to_degrees())
}

/// Inclusive pixel bounding box of an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Box covering `width` x `height` pixels starting at the origin.
    pub fn from_size(width: usize, height: usize) -> Self {
        Self::new(0.0, 0.0, width as f64 - 1.0, height as f64 - 1.0)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            0.5 * (self.min_x + self.max_x),
            0.5 * (self.min_y + self.max_y),
        )
    }

    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ]
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// Nominal gnomonic (TAN) world coordinate system of an exposure.
///
/// ```text
/// (ξ, η) = CD · (x - crpix_x, y - crpix_y)
/// sky    = deproject((ξ, η), crval)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TanWcs {
    /// Reference pixel
    pub crpix: [f64; 2],
    /// Sky position of the reference pixel
    pub crval: SkyCoord,
    /// Linear pixel → tangent-plane matrix in degrees per pixel, row major
    pub cd: [[f64; 2]; 2],
}

impl TanWcs {
    /// North-up WCS with square pixels of `pixel_scale_arcsec`, rotated by `rotation_deg`.
    ///
    /// East is towards -x, matching the usual sky-on-detector parity.
    pub fn from_scale(
        crpix: [f64; 2],
        crval: SkyCoord,
        pixel_scale_arcsec: f64,
        rotation_deg: f64,
    ) -> Self {
        let s = pixel_scale_arcsec / 3600.0;
        let (sin_r, cos_r) = rotation_deg.to_radians().sin_cos();
        Self {
            crpix,
            crval,
            cd: [[-s * cos_r, s * sin_r], [s * sin_r, s * cos_r]],
        }
    }

    fn cd_matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.cd[0][0], self.cd[0][1], self.cd[1][0], self.cd[1][1])
    }

    /// Mean linear pixel scale in arcseconds.
    pub fn pixel_scale_arcsec(&self) -> f64 {
        self.cd_matrix().determinant().abs().sqrt() * 3600.0
    }

    /// Tangent-plane coordinates (degrees, about `crval`) of a pixel.
    pub fn pixel_to_intermediate(&self, x: f64, y: f64) -> Vector2<f64> {
        self.cd_matrix() * Vector2::new(x - self.crpix[0], y - self.crpix[1])
    }

    pub fn pixel_to_sky(&self, x: f64, y: f64) -> SkyCoord {
        gnomonic_deproject(&self.pixel_to_intermediate(x, y), &self.crval)
    }

    /// Pixel position of a sky coordinate; `None` if it is not on the projected hemisphere
    /// or the CD matrix is singular.
    pub fn sky_to_pixel(&self, sky: &SkyCoord) -> Option<(f64, f64)> {
        let tp = gnomonic_project(sky, &self.crval)?;
        let inv = self.cd_matrix().try_inverse()?;
        let p = inv * tp;
        Some((p.x + self.crpix[0], p.y + self.crpix[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_projection_round_trip() {
        let tp = SkyCoord::new(150.0, 2.2);
        let sky = SkyCoord::new(150.05, 2.17);
        let xy = gnomonic_project(&sky, &tp).unwrap();
        let back = gnomonic_deproject(&xy, &tp);
        assert_relative_eq!(back.ra, sky.ra, epsilon = 1e-10);
        assert_relative_eq!(back.dec, sky.dec, epsilon = 1e-10);
    }

    #[test]
    fn test_projection_of_tangent_point_is_origin() {
        let tp = SkyCoord::new(10.0, -45.0);
        let xy = gnomonic_project(&tp, &tp).unwrap();
        assert_relative_eq!(xy.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_opposite_hemisphere_is_not_projected() {
        let tp = SkyCoord::new(0.0, 0.0);
        assert!(gnomonic_project(&SkyCoord::new(180.0, 0.0), &tp).is_none());
    }

    #[test]
    fn test_separation() {
        let a = SkyCoord::new(0.0, 0.0);
        let b = SkyCoord::new(0.0, 1.0);
        assert_relative_eq!(a.separation(&b), 1.0, epsilon = 1e-10);
        // Wraps around RA = 0
        let c = SkyCoord::new(359.5, 0.0);
        let d = SkyCoord::new(0.5, 0.0);
        assert_relative_eq!(c.separation(&d), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_mean_of_coords() {
        let mean = SkyCoord::mean_of(&[SkyCoord::new(359.0, 0.0), SkyCoord::new(1.0, 0.0)]).unwrap();
        assert!(mean.ra < 1e-9 || mean.ra > 360.0 - 1e-9);
        assert_relative_eq!(mean.dec, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_wcs_round_trip() {
        let wcs = TanWcs::from_scale([1024.0, 1024.0], SkyCoord::new(150.0, 2.0), 0.2, 12.0);
        assert_relative_eq!(wcs.pixel_scale_arcsec(), 0.2, epsilon = 1e-10);

        let sky = wcs.pixel_to_sky(100.0, 1900.0);
        let (x, y) = wcs.sky_to_pixel(&sky).unwrap();
        assert_relative_eq!(x, 100.0, epsilon = 1e-6);
        assert_relative_eq!(y, 1900.0, epsilon = 1e-6);
    }

    #[test]
    fn test_reference_pixel_maps_to_crval() {
        let crval = SkyCoord::new(33.0, -12.5);
        let wcs = TanWcs::from_scale([500.0, 400.0], crval, 0.5, 0.0);
        let sky = wcs.pixel_to_sky(500.0, 400.0);
        assert_relative_eq!(sky.ra, crval.ra, epsilon = 1e-12);
        assert_relative_eq!(sky.dec, crval.dec, epsilon = 1e-12);
    }

    #[test]
    fn test_bounding_box() {
        let bbox = BoundingBox::from_size(2048, 4096);
        assert_eq!(bbox.width(), 2047.0);
        assert_eq!(bbox.center(), (1023.5, 2047.5));
        assert!(bbox.contains(0.0, 4095.0));
        assert!(!bbox.contains(-0.5, 10.0));
    }
}
