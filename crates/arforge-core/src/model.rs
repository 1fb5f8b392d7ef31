use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::format::{SourceFormat, TargetFormat, extension_of};

pub type AssetId = String;
pub type JobId = String;

/// Per-target artifact URIs. Each slot is written independently.
pub type FormatUrls = BTreeMap<TargetFormat, String>;

/// Axis-aligned bounds in source units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    /// Extents along X, Y and Z.
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: (self.max[0] - self.min[0]).abs(),
            height: (self.max[1] - self.min[1]).abs(),
            depth: (self.max[2] - self.min[2]).abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
    pub depth: f64,
}

impl Dimensions {
    pub fn max_dimension(&self) -> f64 {
        self.width.max(self.height).max(self.depth)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            width: self.width * factor,
            height: self.height * factor,
            depth: self.depth * factor,
        }
    }
}

/// Validation lifecycle of an asset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pending,
    /// Conversion has been requested and jobs are outstanding.
    Validating,
    Valid,
    Invalid,
    FixedAutomatically,
}

/// Lifecycle of a single conversion job. Transitions only move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Estimated download time on reference links (2 MB/s mobile, 10 MB/s desktop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadTimeEstimate {
    pub mobile_ms: u64,
    pub desktop_ms: u64,
}

/// An uploaded 3D model and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub project_id: String,
    pub original_filename: String,
    /// Lower-cased extension as uploaded; may name an unsupported format.
    pub original_format: String,
    pub original_size: u64,
    pub original_uri: String,
    /// Triangle count as reported by the uploader; 0 when unknown.
    pub poly_count: u64,
    pub material_count: u32,
    pub texture_count: u32,
    pub bounding_box: Option<BoundingBox>,
    pub dimensions: Option<Dimensions>,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,
    /// Corrections applied upstream of validation, e.g. by an importer.
    pub auto_fixes: Vec<String>,
    pub load_time: Option<LoadTimeEstimate>,
    pub format_urls: FormatUrls,
    pub lod_urls: BTreeMap<String, String>,
    pub recommended_lod: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    /// A new `PENDING` asset; the format is taken from the file extension.
    pub fn new(
        project_id: impl Into<String>,
        original_filename: impl Into<String>,
        original_size: u64,
        original_uri: impl Into<String>,
    ) -> Self {
        let original_filename = original_filename.into();
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            original_format: extension_of(&original_filename),
            original_filename,
            original_size,
            original_uri: original_uri.into(),
            poly_count: 0,
            material_count: 0,
            texture_count: 0,
            bounding_box: None,
            dimensions: None,
            validation_status: ValidationStatus::Pending,
            validation_errors: Vec::new(),
            auto_fixes: Vec::new(),
            load_time: None,
            format_urls: FormatUrls::new(),
            lod_urls: BTreeMap::new(),
            recommended_lod: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_geometry(mut self, poly_count: u64, material_count: u32, texture_count: u32) -> Self {
        self.poly_count = poly_count;
        self.material_count = material_count;
        self.texture_count = texture_count;
        self
    }

    pub fn with_bounding_box(mut self, bbox: BoundingBox) -> Self {
        self.dimensions = Some(bbox.dimensions());
        self.bounding_box = Some(bbox);
        self
    }

    /// `None` when the stored format is not an accepted source.
    pub fn source_format(&self) -> Option<SourceFormat> {
        self.original_format.parse().ok()
    }
}

/// One request to produce one target format for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: JobId,
    pub asset_id: AssetId,
    pub source_format: String,
    pub target_format: TargetFormat,
    pub status: JobStatus,
    /// Attempts started so far.
    pub attempts: u32,
    /// Wall time from first start to the terminal transition.
    pub processing_ms: Option<u64>,
    /// Most recent failure message; kept while retries are pending.
    pub error: Option<String>,
    pub output_uri: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversionJob {
    pub fn new(asset_id: impl Into<String>, source_format: impl Into<String>, target: TargetFormat) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            asset_id: asset_id.into(),
            source_format: source_format.into(),
            target_format: target,
            status: JobStatus::Pending,
            attempts: 0,
            processing_ms: None,
            error: None,
            output_uri: None,
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Milliseconds since the first attempt started, if it has.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        self.started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
    }
}
