//! Reference catalogs queried by sky circle.

use crate::error::ConfigurationError;
use crate::geometry::SkyCoord;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// An absolute astrometric reference position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStar {
    pub id: u64,
    pub sky: SkyCoord,
    /// Magnitude in the queried filter
    pub mag: f64,
    /// One-dimensional position uncertainty in arcseconds
    pub position_error_arcsec: f64,
}

/// Source of reference stars for a patch of sky.
pub trait ReferenceCatalog {
    /// All reference stars within `radius_deg` of `center`, with magnitudes in `filter`.
    ///
    /// # Errors
    /// [`ConfigurationError::MissingFilter`] if the catalog has no magnitudes for `filter`.
    fn load_sky_circle(
        &self,
        center: &SkyCoord,
        radius_deg: f64,
        filter: &str,
    ) -> Result<Vec<ReferenceStar>, ConfigurationError>;

    /// Filter used when the caller does not name one.
    fn default_filter(&self) -> Option<&str>;
}

/// One row of an [`InMemoryReferenceCatalog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub id: u64,
    pub ra: f64,
    pub dec: f64,
    /// Magnitudes aligned with [`InMemoryReferenceCatalog::filters`]
    pub mags: Vec<f64>,
    pub position_error_arcsec: f64,
}

/// Reference catalog held in memory and stored as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InMemoryReferenceCatalog {
    pub filters: Vec<String>,
    pub entries: Vec<ReferenceEntry>,
}

impl InMemoryReferenceCatalog {
    pub fn new(filters: Vec<String>) -> Self {
        Self {
            filters,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Save catalog to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Load catalog from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl ReferenceCatalog for InMemoryReferenceCatalog {
    fn load_sky_circle(
        &self,
        center: &SkyCoord,
        radius_deg: f64,
        filter: &str,
    ) -> Result<Vec<ReferenceStar>, ConfigurationError> {
        let column = self
            .filters
            .iter()
            .position(|f| f == filter)
            .ok_or_else(|| ConfigurationError::MissingFilter(filter.to_string()))?;

        let stars: Vec<ReferenceStar> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let sky = SkyCoord::new(entry.ra, entry.dec);
                if sky.separation(center) > radius_deg {
                    return None;
                }
                Some(ReferenceStar {
                    id: entry.id,
                    sky,
                    mag: entry.mags.get(column).copied().unwrap_or(f64::NAN),
                    position_error_arcsec: entry.position_error_arcsec,
                })
            })
            .collect();

        log::info!(
            "Loaded {} reference stars within {:.3} deg of ({:.4}, {:.4}) in filter {}",
            stars.len(),
            radius_deg,
            center.ra,
            center.dec,
            filter
        );
        Ok(stars)
    }

    fn default_filter(&self) -> Option<&str> {
        self.filters.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn catalog() -> InMemoryReferenceCatalog {
        let mut cat = InMemoryReferenceCatalog::new(vec!["g".to_string(), "r".to_string()]);
        cat.entries.push(ReferenceEntry {
            id: 1,
            ra: 10.0,
            dec: 0.0,
            mags: vec![18.0, 17.5],
            position_error_arcsec: 0.01,
        });
        cat.entries.push(ReferenceEntry {
            id: 2,
            ra: 12.0,
            dec: 0.0,
            mags: vec![19.0, 18.5],
            position_error_arcsec: 0.01,
        });
        cat
    }

    #[test]
    fn test_sky_circle_filters_by_distance() {
        let stars = catalog()
            .load_sky_circle(&SkyCoord::new(10.1, 0.0), 0.5, "r")
            .unwrap();
        assert_eq!(stars.len(), 1);
        assert_eq!(stars[0].id, 1);
        assert_eq!(stars[0].mag, 17.5);
    }

    #[test]
    fn test_missing_filter_is_configuration_error() {
        let err = catalog().load_sky_circle(&SkyCoord::new(10.0, 0.0), 1.0, "z");
        assert_eq!(err, Err(ConfigurationError::MissingFilter("z".to_string())));
    }

    #[test]
    fn test_default_filter_is_first_column() {
        assert_eq!(catalog().default_filter(), Some("g"));
        assert_eq!(InMemoryReferenceCatalog::default().default_filter(), None);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("refcat.json");
        let cat = catalog();
        cat.save_to_file(&path).unwrap();
        assert_eq!(InMemoryReferenceCatalog::load_from_file(&path).unwrap(), cat);
    }
}
