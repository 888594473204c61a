//! Detection catalogs and per-exposure metadata.
//!
//! A [`SourceCatalog`] is a table of [`SourceRecord`]s described by a
//! [`SourceSchema`] of named floating-point measurement columns and named
//! boolean flag columns. Measurement algorithms publish their outputs under
//! a common prefix, e.g. the `base_SdssCentroid` algorithm provides
//! `base_SdssCentroid_x`, `base_SdssCentroid_xSigma` and so on.
//!
//! Column names are resolved to typed keys once per catalog
//! ([`SourceSchema::float_key`], [`SourceSchema::flag_key`]) so that a
//! missing column is reported before any record is evaluated.

use crate::geometry::{BoundingBox, TanWcs};
use crate::photometry::PhotometricCalibration;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Field holding the star/galaxy classifier output.
pub const EXTENDEDNESS_FIELD: &str = "base_ClassificationExtendedness_value";

/// Errors raised while resolving catalog columns
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("measurement field '{0}' is not present in the source schema")]
    MissingField(String),

    #[error("flag '{0}' is not present in the source schema")]
    MissingFlag(String),

    #[error("record {index} has {found} {kind} columns, schema declares {expected}")]
    RecordWidth {
        index: usize,
        kind: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Explicit identity of one exposure of one detector.
///
/// Carried alongside every per-exposure record so results can be routed
/// back without re-deriving identity from names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExposureId {
    pub visit: u32,
    pub ccd: u32,
}

impl ExposureId {
    pub fn new(visit: u32, ccd: u32) -> Self {
        Self { visit, ccd }
    }
}

impl fmt::Display for ExposureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.visit, self.ccd)
    }
}

/// Column index of a floating-point measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatKey(usize);

/// Column index of a boolean flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagKey(usize);

/// Names of the measurement and flag columns of a catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSchema {
    pub float_fields: Vec<String>,
    pub flag_fields: Vec<String>,
}

impl SourceSchema {
    /// Schema providing every column [`MeasurementFields`] reads, the optional
    /// extendedness column, and the given flags.
    pub fn standard(fields: &MeasurementFields, flags: &[String]) -> Self {
        let mut float_fields = fields.float_field_names();
        float_fields.push(EXTENDEDNESS_FIELD.to_string());

        let mut flag_fields: Vec<String> = Vec::with_capacity(flags.len() + 1);
        for name in flags.iter().cloned().chain(std::iter::once(fields.flux_flag())) {
            if !flag_fields.contains(&name) {
                flag_fields.push(name);
            }
        }

        Self {
            float_fields,
            flag_fields,
        }
    }

    pub fn float_key(&self, name: &str) -> Result<FloatKey, SchemaError> {
        self.float_fields
            .iter()
            .position(|f| f == name)
            .map(FloatKey)
            .ok_or_else(|| SchemaError::MissingField(name.to_string()))
    }

    pub fn flag_key(&self, name: &str) -> Result<FlagKey, SchemaError> {
        self.flag_fields
            .iter()
            .position(|f| f == name)
            .map(FlagKey)
            .ok_or_else(|| SchemaError::MissingFlag(name.to_string()))
    }
}

/// One detected source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: u64,
    /// Id of the deblend parent, 0 for sources that were not deblended
    pub parent: u64,
    /// Number of peaks in the detection footprint
    pub footprint_peaks: usize,
    pub floats: Vec<f64>,
    pub flags: Vec<bool>,
}

impl SourceRecord {
    #[inline]
    pub fn get(&self, key: FloatKey) -> f64 {
        self.floats[key.0]
    }

    #[inline]
    pub fn flag(&self, key: FlagKey) -> bool {
        self.flags[key.0]
    }
}

/// An ordered table of detections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    pub schema: SourceSchema,
    pub records: Vec<SourceRecord>,
}

impl SourceCatalog {
    pub fn new(schema: SourceSchema) -> Self {
        Self {
            schema,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Check every record carries exactly the columns its schema declares.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let n_float = self.schema.float_fields.len();
        let n_flag = self.schema.flag_fields.len();
        for (index, record) in self.records.iter().enumerate() {
            if record.floats.len() != n_float {
                return Err(SchemaError::RecordWidth {
                    index,
                    kind: "float",
                    expected: n_float,
                    found: record.floats.len(),
                });
            }
            if record.flags.len() != n_flag {
                return Err(SchemaError::RecordWidth {
                    index,
                    kind: "flag",
                    expected: n_flag,
                    found: record.flags.len(),
                });
            }
        }
        Ok(())
    }

    /// Build a catalog with [`SourceSchema::standard`] columns from plain detections.
    ///
    /// # Errors
    /// [`SchemaError::MissingFlag`] if a detection raises a flag that is not in `flags`
    /// (and is not the flux flag).
    pub fn from_detections(
        fields: &MeasurementFields,
        flags: &[String],
        detections: &[Detection],
    ) -> Result<Self, SchemaError> {
        let schema = SourceSchema::standard(fields, flags);
        let mut catalog = Self::new(schema);
        for det in detections {
            let record = det.to_record(&catalog.schema)?;
            catalog.records.push(record);
        }
        Ok(catalog)
    }
}

/// Algorithm prefixes of the measurements used for calibration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementFields {
    pub flux: String,
    pub centroid: String,
    pub shape: String,
}

impl Default for MeasurementFields {
    fn default() -> Self {
        Self {
            flux: "base_CircularApertureFlux_17_0".to_string(),
            centroid: "base_SdssCentroid".to_string(),
            shape: "base_SdssShape".to_string(),
        }
    }
}

impl MeasurementFields {
    /// Flag raised by the flux algorithm on failure.
    pub fn flux_flag(&self) -> String {
        format!("{}_flag", self.flux)
    }

    fn float_field_names(&self) -> Vec<String> {
        vec![
            format!("{}_x", self.centroid),
            format!("{}_y", self.centroid),
            format!("{}_xSigma", self.centroid),
            format!("{}_ySigma", self.centroid),
            format!("{}_flux", self.flux),
            format!("{}_fluxSigma", self.flux),
            format!("{}_xx", self.shape),
            format!("{}_yy", self.shape),
            format!("{}_xy", self.shape),
        ]
    }

    /// Resolve all measurement columns against a schema.
    pub fn resolve(&self, schema: &SourceSchema) -> Result<StandardKeys, SchemaError> {
        let key = |name: String| schema.float_key(&name);
        Ok(StandardKeys {
            x: key(format!("{}_x", self.centroid))?,
            y: key(format!("{}_y", self.centroid))?,
            x_sigma: key(format!("{}_xSigma", self.centroid))?,
            y_sigma: key(format!("{}_ySigma", self.centroid))?,
            flux: key(format!("{}_flux", self.flux))?,
            flux_sigma: key(format!("{}_fluxSigma", self.flux))?,
            xx: key(format!("{}_xx", self.shape))?,
            yy: key(format!("{}_yy", self.shape))?,
            xy: key(format!("{}_xy", self.shape))?,
        })
    }
}

/// Resolved measurement columns of a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardKeys {
    pub x: FloatKey,
    pub y: FloatKey,
    pub x_sigma: FloatKey,
    pub y_sigma: FloatKey,
    pub flux: FloatKey,
    pub flux_sigma: FloatKey,
    pub xx: FloatKey,
    pub yy: FloatKey,
    pub xy: FloatKey,
}

impl StandardKeys {
    /// Centroid variances (vx, vy, vxy).
    ///
    /// The off-diagonal term is not measured directly; it is scaled from the
    /// shape moments: `vxy = mxy · (vx + vy) / (mxx + myy)`.
    pub fn position_variances(&self, record: &SourceRecord) -> (f64, f64, f64) {
        let vx = record.get(self.x_sigma).powi(2);
        let vy = record.get(self.y_sigma).powi(2);
        let mxx = record.get(self.xx);
        let myy = record.get(self.yy);
        let mxy = record.get(self.xy);
        let vxy = mxy * (vx + vy) / (mxx + myy);
        (vx, vy, vxy)
    }
}

/// A detection in plain form, for building catalogs programmatically.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    pub x_sigma: f64,
    pub y_sigma: f64,
    pub flux: f64,
    pub flux_sigma: f64,
    pub xx: f64,
    pub yy: f64,
    pub xy: f64,
    pub parent: u64,
    pub footprint_peaks: usize,
    pub extendedness: f64,
    /// Names of the flags raised on this detection
    pub flags: Vec<String>,
}

impl Detection {
    /// An isolated, round, unflagged point source.
    pub fn point_source(id: u64, x: f64, y: f64, flux: f64, flux_sigma: f64) -> Self {
        Self {
            id,
            x,
            y,
            x_sigma: 0.05,
            y_sigma: 0.05,
            flux,
            flux_sigma,
            xx: 2.0,
            yy: 2.0,
            xy: 0.0,
            parent: 0,
            footprint_peaks: 1,
            extendedness: 0.0,
            flags: Vec::new(),
        }
    }

    fn to_record(&self, schema: &SourceSchema) -> Result<SourceRecord, SchemaError> {
        let floats = vec![
            self.x,
            self.y,
            self.x_sigma,
            self.y_sigma,
            self.flux,
            self.flux_sigma,
            self.xx,
            self.yy,
            self.xy,
            self.extendedness,
        ];
        debug_assert_eq!(floats.len(), schema.float_fields.len());

        let mut flags = vec![false; schema.flag_fields.len()];
        for name in &self.flags {
            let FlagKey(k) = schema.flag_key(name)?;
            flags[k] = true;
        }

        Ok(SourceRecord {
            id: self.id,
            parent: self.parent,
            footprint_peaks: self.footprint_peaks,
            floats,
            flags,
        })
    }
}

/// Metadata of one exposure needed to calibrate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureMeta {
    pub id: ExposureId,
    /// Nominal WCS the distortion model starts from
    pub wcs: TanWcs,
    pub bbox: BoundingBox,
    pub filter: String,
    pub calib: PhotometricCalibration,
    pub instrument: String,
}

/// An exposure catalog together with its metadata and sky partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureRecord {
    pub tract: u32,
    pub meta: ExposureMeta,
    pub catalog: SourceCatalog,
}
