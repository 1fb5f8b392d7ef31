use serde::{Deserialize, Serialize};

use crate::format::{SourceFormat, TargetFormat};
use crate::model::{AssetId, ConversionJob, JobId};
use crate::normalize::CorrectiveTransform;
use crate::optimize::LodLevel;

/// Options accepted by `request_conversion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionOptions {
    /// Repack glTF-family outputs through the simplifier at 0% reduction.
    pub optimize: bool,
    /// Queue a LOD ladder alongside the conversions.
    pub generate_lods: bool,
    /// Bake the suggested orientation and scale fix into interchange imports.
    pub apply_corrections: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            generate_lods: false,
            apply_corrections: false,
        }
    }
}

/// Payload of the conversion queue: one job, one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionWork {
    pub job_id: JobId,
    pub asset_id: AssetId,
    pub source_uri: String,
    pub source_format: SourceFormat,
    pub target_format: TargetFormat,
    pub optimize: bool,
    pub transform: Option<CorrectiveTransform>,
}

/// Payload of the optimization queue: a LOD ladder for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationWork {
    pub asset_id: AssetId,
    pub source_uri: String,
    pub source_format: SourceFormat,
    pub levels: Vec<LodLevel>,
    /// Same correction as the conversions of the request.
    pub transform: Option<CorrectiveTransform>,
}

/// Aggregate view of an asset's conversion jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionStatus {
    pub asset_id: AssetId,
    /// Newest first.
    pub jobs: Vec<ConversionJob>,
    /// Percentage of jobs in a terminal state; 0 when there are none.
    pub overall_progress_percent: u8,
}

impl ConversionStatus {
    pub fn new(asset_id: AssetId, jobs: Vec<ConversionJob>) -> Self {
        let terminal = jobs.iter().filter(|j| j.status.is_terminal()).count();
        let overall_progress_percent = if jobs.is_empty() {
            0
        } else {
            (terminal as f64 * 100.0 / jobs.len() as f64).round() as u8
        };
        Self {
            asset_id,
            jobs,
            overall_progress_percent,
        }
    }

    pub fn is_finished(&self) -> bool {
        !self.jobs.is_empty() && self.overall_progress_percent == 100
    }
}
