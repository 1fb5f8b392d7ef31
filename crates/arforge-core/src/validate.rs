//! AR-readiness validation.
//!
//! [`evaluate`] is pure: it only reads the asset and always yields the same
//! report for the same input. [`ReadinessValidator`] runs it against a stored
//! asset and persists the outcome.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::format::{FormatClass, classify_extension};
use crate::model::{Asset, BoundingBox, Dimensions, LoadTimeEstimate, ValidationStatus};
use crate::storage::{RecordStore, ValidationOutcome};

pub const MB: u64 = 1024 * 1024;

const MOBILE_BYTES_PER_SEC: f64 = 2.0 * MB as f64;
const DESKTOP_BYTES_PER_SEC: f64 = 10.0 * MB as f64;

/// Thresholds applied by [`evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_file_size: u64,
    pub mobile_file_size: u64,
    pub max_polygons: u64,
    pub mobile_polygons: u64,
    pub max_materials: u32,
    pub max_textures: u32,
    /// Plausible real-world extent, in meters.
    pub min_dimension: f64,
    pub max_dimension: f64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_file_size: 50 * MB,
            mobile_file_size: 15 * MB,
            max_polygons: 500_000,
            mobile_polygons: 100_000,
            max_materials: 20,
            max_textures: 30,
            min_dimension: 0.01,
            max_dimension: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub severity: Severity,
    pub message: String,
    pub value: Option<f64>,
    pub limit: Option<f64>,
}

impl ValidationCheck {
    fn new(name: &str, passed: bool, severity: Severity, message: String) -> Self {
        Self {
            name: name.to_owned(),
            passed,
            severity,
            message,
            value: None,
            limit: None,
        }
    }

    fn measured(mut self, value: f64, limit: f64) -> Self {
        self.value = Some(value);
        self.limit = Some(limit);
        self
    }

    fn is_blocking(&self) -> bool {
        !self.passed && self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub poly_count: u64,
    pub material_count: u32,
    pub texture_count: u32,
    pub dimensions: Option<Dimensions>,
    pub bounding_box: Option<BoundingBox>,
    pub estimated_load_time: LoadTimeEstimate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: Vec<ValidationCheck>,
    /// True when no error-severity check failed.
    pub is_valid: bool,
    pub status: ValidationStatus,
    pub recommendations: Vec<String>,
    pub metadata: ReportMetadata,
}

impl ValidationReport {
    pub fn check(&self, name: &str) -> Option<&ValidationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Messages of every failed check, errors and warnings alike.
    pub fn failed_messages(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.message.clone())
            .collect()
    }
}

pub fn estimate_load_time(size: u64) -> LoadTimeEstimate {
    let bytes = size as f64;
    LoadTimeEstimate {
        mobile_ms: (bytes / MOBILE_BYTES_PER_SEC * 1000.0).round() as u64,
        desktop_ms: (bytes / DESKTOP_BYTES_PER_SEC * 1000.0).round() as u64,
    }
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / MB as f64
}

/// Run every readiness check against an asset.
///
/// Checks are emitted in a fixed order: `file_size`, `mobile_file_size`,
/// `poly_count`, `material_count`, `format`.
pub fn evaluate(asset: &Asset, limits: &ValidationLimits) -> ValidationReport {
    let size_mb = megabytes(asset.original_size);
    let mut checks = Vec::with_capacity(5);
    let mut recommendations = Vec::new();

    let max_mb = megabytes(limits.max_file_size);
    let fits = asset.original_size <= limits.max_file_size;
    checks.push(
        if fits {
            ValidationCheck::new(
                "file_size",
                true,
                Severity::Info,
                format!("File size {size_mb:.2} MB is within the {max_mb:.0} MB limit"),
            )
        } else {
            ValidationCheck::new(
                "file_size",
                false,
                Severity::Error,
                format!("File size {size_mb:.2} MB exceeds the maximum of {max_mb:.0} MB"),
            )
        }
        .measured(size_mb, max_mb),
    );

    let mobile_mb = megabytes(limits.mobile_file_size);
    let mobile_fits = asset.original_size <= limits.mobile_file_size;
    checks.push(
        if mobile_fits {
            ValidationCheck::new(
                "mobile_file_size",
                true,
                Severity::Info,
                format!("File size {size_mb:.2} MB is suitable for mobile AR"),
            )
        } else {
            recommendations.push(
                "Apply Draco geometry compression and re-encode textures to shrink the mobile download"
                    .to_owned(),
            );
            ValidationCheck::new(
                "mobile_file_size",
                false,
                Severity::Warning,
                format!(
                    "File size {size_mb:.2} MB exceeds the {mobile_mb:.0} MB mobile target"
                ),
            )
        }
        .measured(size_mb, mobile_mb),
    );

    let polys = asset.poly_count;
    let poly_check = if polys == 0 {
        ValidationCheck::new(
            "poly_count",
            true,
            Severity::Info,
            "Polygon count not reported".to_owned(),
        )
    } else if polys > limits.max_polygons {
        recommendations.push(format!(
            "Decimate the mesh below {} polygons before publishing",
            limits.max_polygons
        ));
        ValidationCheck::new(
            "poly_count",
            false,
            Severity::Error,
            format!(
                "Polygon count {polys} exceeds the maximum of {}",
                limits.max_polygons
            ),
        )
    } else if polys > limits.mobile_polygons {
        recommendations.push(
            "Generate LODs (50% and 80% reduction) for mobile AR sessions".to_owned(),
        );
        ValidationCheck::new(
            "poly_count",
            true,
            Severity::Warning,
            format!(
                "Polygon count {polys} is above the {} mobile target",
                limits.mobile_polygons
            ),
        )
    } else {
        ValidationCheck::new(
            "poly_count",
            true,
            Severity::Info,
            format!("Polygon count {polys} is mobile friendly"),
        )
    };
    checks.push(poly_check.measured(polys as f64, limits.max_polygons as f64));

    let materials = asset.material_count;
    checks.push(
        if materials <= limits.max_materials {
            ValidationCheck::new(
                "material_count",
                true,
                Severity::Info,
                format!("{materials} materials"),
            )
        } else {
            recommendations
                .push("Merge materials that share parameters to reduce draw calls".to_owned());
            ValidationCheck::new(
                "material_count",
                false,
                Severity::Warning,
                format!(
                    "Material count {materials} exceeds the recommended {}",
                    limits.max_materials
                ),
            )
        }
        .measured(materials as f64, limits.max_materials as f64),
    );

    let format = asset.original_format.as_str();
    checks.push(match classify_extension(format) {
        FormatClass::ArReady => ValidationCheck::new(
            "format",
            true,
            Severity::Info,
            format!("Format '{format}' is AR-ready"),
        ),
        FormatClass::Convertible => {
            recommendations.push(format!(
                "Convert '{format}' to GLB for Android and Web, and USDZ for iOS"
            ));
            ValidationCheck::new(
                "format",
                true,
                Severity::Warning,
                format!("Format '{format}' requires conversion before AR use"),
            )
        }
        FormatClass::Unsupported => {
            recommendations.push("Re-export the model as GLB, glTF or USDZ".to_owned());
            ValidationCheck::new(
                "format",
                false,
                Severity::Error,
                format!("Format '{format}' is not supported"),
            )
        }
    });

    if asset.texture_count > limits.max_textures {
        recommendations.push(format!(
            "Atlas textures: {} exceed the recommended {}",
            asset.texture_count, limits.max_textures
        ));
    }

    if let Some(dims) = asset.dimensions {
        let extent = dims.max_dimension();
        if extent < limits.min_dimension || extent > limits.max_dimension {
            recommendations.push(format!(
                "Largest extent {extent:.3} is outside {}..{} m; check the export units",
                limits.min_dimension, limits.max_dimension
            ));
        }
    }

    let is_valid = !checks.iter().any(ValidationCheck::is_blocking);
    let status = if !is_valid {
        ValidationStatus::Invalid
    } else if !asset.auto_fixes.is_empty() {
        ValidationStatus::FixedAutomatically
    } else {
        ValidationStatus::Valid
    };

    ValidationReport {
        checks,
        is_valid,
        status,
        recommendations,
        metadata: ReportMetadata {
            poly_count: asset.poly_count,
            material_count: asset.material_count,
            texture_count: asset.texture_count,
            dimensions: asset.dimensions,
            bounding_box: asset.bounding_box,
            estimated_load_time: estimate_load_time(asset.original_size),
        },
    }
}

/// Validates stored assets and records the outcome.
#[derive(Clone)]
pub struct ReadinessValidator {
    records: Arc<dyn RecordStore>,
    limits: ValidationLimits,
}

impl ReadinessValidator {
    pub fn new(records: Arc<dyn RecordStore>, limits: ValidationLimits) -> Self {
        Self { records, limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Validate an asset by id and persist status, failed checks and load time.
    pub async fn validate_asset(&self, asset_id: &str) -> Result<ValidationReport, PipelineError> {
        let asset = self
            .records
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("asset", asset_id))?;

        let report = evaluate(&asset, &self.limits);
        debug!(asset_id, checks = report.checks.len(), "asset evaluated");

        self.records
            .record_validation(
                asset_id,
                ValidationOutcome {
                    status: report.status,
                    errors: report.failed_messages(),
                    load_time: report.metadata.estimated_load_time,
                },
            )
            .await?;

        info!(
            asset_id,
            status = %report.status,
            is_valid = report.is_valid,
            "asset validated"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRecordStore;

    fn asset(file: &str, size: u64, polys: u64) -> Asset {
        Asset::new("p1", file, size, format!("memory://{file}")).with_geometry(polys, 3, 4)
    }

    #[test]
    fn small_glb_is_valid_with_all_checks_passing() {
        let report = evaluate(&asset("chair.glb", 5 * MB, 50_000), &ValidationLimits::default());
        assert!(report.is_valid);
        assert_eq!(report.status, ValidationStatus::Valid);
        assert!(report.checks.iter().all(|c| c.passed));
        let names: Vec<_> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            ["file_size", "mobile_file_size", "poly_count", "material_count", "format"]
        );
    }

    #[test]
    fn oversized_file_fails_with_error() {
        let report = evaluate(&asset("big.glb", 60 * MB, 1_000), &ValidationLimits::default());
        assert!(!report.is_valid);
        assert_eq!(report.status, ValidationStatus::Invalid);
        let check = report.check("file_size").unwrap();
        assert!(!check.passed);
        assert_eq!(check.severity, Severity::Error);
    }

    #[test]
    fn mobile_size_overrun_is_only_a_warning() {
        let report = evaluate(&asset("mid.glb", 20 * MB, 1_000), &ValidationLimits::default());
        assert!(report.is_valid);
        let check = report.check("mobile_file_size").unwrap();
        assert!(!check.passed);
        assert_eq!(check.severity, Severity::Warning);
        assert!(!report.recommendations.is_empty());
    }

    #[test]
    fn heavy_mesh_is_warned_then_rejected() {
        let limits = ValidationLimits::default();
        let warned = evaluate(&asset("a.glb", MB, 200_000), &limits);
        let poly = warned.check("poly_count").unwrap();
        assert!(poly.passed);
        assert_eq!(poly.severity, Severity::Warning);

        let rejected = evaluate(&asset("a.glb", MB, 600_000), &limits);
        assert!(!rejected.is_valid);
        assert!(!rejected.check("poly_count").unwrap().passed);
    }

    #[test]
    fn unsupported_format_is_invalid() {
        let report = evaluate(&asset("plan.dwg", MB, 10), &ValidationLimits::default());
        assert!(!report.is_valid);
        let check = report.check("format").unwrap();
        assert_eq!(check.severity, Severity::Error);
    }

    #[test]
    fn convertible_format_passes_with_recommendation() {
        let report = evaluate(&asset("sofa.fbx", MB, 10), &ValidationLimits::default());
        assert!(report.is_valid);
        assert!(report.recommendations.iter().any(|r| r.contains("USDZ")));
    }

    #[test]
    fn auto_fixes_report_fixed_automatically() {
        let mut fixed = asset("a.glb", MB, 10);
        fixed.auto_fixes.push("recentered pivot".into());
        let report = evaluate(&fixed, &ValidationLimits::default());
        assert_eq!(report.status, ValidationStatus::FixedAutomatically);
    }

    #[test]
    fn load_time_follows_reference_bandwidths() {
        let estimate = estimate_load_time(10 * MB);
        assert_eq!(estimate.mobile_ms, 5_000);
        assert_eq!(estimate.desktop_ms, 1_000);
    }

    #[tokio::test]
    async fn validate_asset_persists_outcome_and_is_idempotent() {
        let records = Arc::new(MemoryRecordStore::new());
        let stored = asset("big.glb", 60 * MB, 10);
        let id = stored.id.clone();
        records.insert_asset(stored).await.unwrap();

        let validator = ReadinessValidator::new(records.clone(), ValidationLimits::default());
        let first = validator.validate_asset(&id).await.unwrap();
        let second = validator.validate_asset(&id).await.unwrap();
        assert_eq!(first, second);

        let saved = records.get_asset(&id).await.unwrap().unwrap();
        assert_eq!(saved.validation_status, ValidationStatus::Invalid);
        assert_eq!(saved.validation_errors, first.failed_messages());
        assert_eq!(saved.load_time, Some(estimate_load_time(60 * MB)));
    }

    #[tokio::test]
    async fn validate_unknown_asset_is_not_found() {
        let validator = ReadinessValidator::new(
            Arc::new(MemoryRecordStore::new()),
            ValidationLimits::default(),
        );
        let err = validator.validate_asset("missing").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }
}
