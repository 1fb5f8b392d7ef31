use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::format::{SourceFormat, TargetFormat};
use crate::model::{Asset, ConversionJob, JobId, ValidationStatus};
use crate::normalize::suggest_transform;
use crate::optimize::lod::default_ladder;
use crate::runtime::queue::WorkQueue;
use crate::runtime::types::{ConversionOptions, ConversionStatus, ConversionWork, OptimizationWork};
use crate::storage::RecordStore;

/// Targets produced when the caller does not name any.
const DEFAULT_TARGETS: &[(SourceFormat, &[TargetFormat])] = &[
    (SourceFormat::Glb, &[TargetFormat::Draco, TargetFormat::Usdz]),
    (SourceFormat::Gltf, &[TargetFormat::Draco, TargetFormat::Usdz]),
    (SourceFormat::Usdz, &[TargetFormat::Glb, TargetFormat::Draco]),
    (
        SourceFormat::Fbx,
        &[TargetFormat::Glb, TargetFormat::Draco, TargetFormat::Usdz],
    ),
    (
        SourceFormat::Obj,
        &[TargetFormat::Glb, TargetFormat::Draco, TargetFormat::Usdz],
    ),
    (
        SourceFormat::Stl,
        &[TargetFormat::Glb, TargetFormat::Draco, TargetFormat::Usdz],
    ),
    (
        SourceFormat::ThreeDs,
        &[TargetFormat::Glb, TargetFormat::Draco, TargetFormat::Usdz],
    ),
    (
        SourceFormat::Step,
        &[TargetFormat::Glb, TargetFormat::Draco, TargetFormat::Usdz],
    ),
    (
        SourceFormat::Stp,
        &[TargetFormat::Glb, TargetFormat::Draco, TargetFormat::Usdz],
    ),
];

pub fn default_targets(source: SourceFormat) -> Vec<TargetFormat> {
    DEFAULT_TARGETS
        .iter()
        .find(|(format, _)| *format == source)
        .map(|(_, targets)| targets.to_vec())
        .unwrap_or_default()
}

/// Keep the first occurrence of each target, preserving order.
fn dedupe(targets: &[TargetFormat]) -> Vec<TargetFormat> {
    let mut seen = Vec::with_capacity(targets.len());
    for target in targets {
        if !seen.contains(target) {
            seen.push(*target);
        }
    }
    seen
}

/// Turns conversion requests into job records and queued work.
#[derive(Clone)]
pub struct ConversionOrchestrator {
    records: Arc<dyn RecordStore>,
    conversions: WorkQueue<ConversionWork>,
    optimizations: WorkQueue<OptimizationWork>,
}

impl ConversionOrchestrator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        conversions: WorkQueue<ConversionWork>,
        optimizations: WorkQueue<OptimizationWork>,
    ) -> Self {
        Self {
            records,
            conversions,
            optimizations,
        }
    }

    async fn require_asset(&self, asset_id: &str) -> Result<Asset, PipelineError> {
        self.records
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("asset", asset_id))
    }

    /// Create one `PENDING` job per target and queue them.
    ///
    /// Returns as soon as the work is queued. An empty `targets` list selects
    /// the defaults for the source format.
    pub async fn request_conversion(
        &self,
        asset_id: &str,
        targets: &[TargetFormat],
        options: ConversionOptions,
    ) -> Result<Vec<JobId>, PipelineError> {
        let asset = self.require_asset(asset_id).await?;
        let source = asset
            .source_format()
            .ok_or_else(|| PipelineError::UnsupportedFormat(asset.original_format.clone()))?;

        let targets = if targets.is_empty() {
            default_targets(source)
        } else {
            dedupe(targets)
        };

        let transform = if options.apply_corrections {
            asset
                .bounding_box
                .as_ref()
                .and_then(|bbox| suggest_transform(&asset.original_format, bbox, None))
        } else {
            None
        };

        self.records
            .set_validation_status(asset_id, ValidationStatus::Validating)
            .await?;

        let mut jobs = Vec::with_capacity(targets.len());
        for target in &targets {
            let job = ConversionJob::new(asset_id, &asset.original_format, *target);
            if let Err(err) = self.records.insert_job(job.clone()).await {
                self.abandon(&jobs, &err).await;
                return Err(err);
            }
            jobs.push(job);
        }

        for (index, job) in jobs.iter().enumerate() {
            let work = ConversionWork {
                job_id: job.id.clone(),
                asset_id: asset_id.to_owned(),
                source_uri: asset.original_uri.clone(),
                source_format: source,
                target_format: job.target_format,
                optimize: options.optimize,
                transform,
            };
            if let Err(err) = self.conversions.enqueue(work) {
                warn!(job_id = %job.id, error = %err, "could not queue conversion");
                self.abandon(&jobs[index..], &err).await;
                return Err(err);
            }
        }

        // Conversions are already queued; a missing ladder does not undo them.
        if options.generate_lods {
            let lods = OptimizationWork {
                asset_id: asset_id.to_owned(),
                source_uri: asset.original_uri.clone(),
                source_format: source,
                levels: default_ladder(),
                transform,
            };
            if let Err(err) = self.optimizations.enqueue(lods) {
                warn!(asset_id, error = %err, "could not queue lod generation");
            }
        }

        info!(
            asset_id,
            source = %source,
            targets = ?targets,
            lods = options.generate_lods,
            "conversion requested"
        );
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    /// Fail jobs that were recorded but will never reach a worker.
    async fn abandon(&self, jobs: &[ConversionJob], err: &PipelineError) {
        let message = err.to_string();
        for job in jobs {
            if let Err(e) = self.records.fail_job(&job.id, &message, None).await {
                error!(job_id = %job.id, error = %e, "failed to mark unqueued job failed");
            }
        }
    }

    pub async fn get_status(&self, asset_id: &str) -> Result<ConversionStatus, PipelineError> {
        self.require_asset(asset_id).await?;
        let jobs = self.records.jobs_for_asset(asset_id).await?;
        Ok(ConversionStatus::new(asset_id.to_owned(), jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_targets_follow_source_family() {
        assert_eq!(
            default_targets(SourceFormat::Glb),
            vec![TargetFormat::Draco, TargetFormat::Usdz]
        );
        assert_eq!(
            default_targets(SourceFormat::Usdz),
            vec![TargetFormat::Glb, TargetFormat::Draco]
        );
        assert_eq!(
            default_targets(SourceFormat::Fbx),
            vec![TargetFormat::Glb, TargetFormat::Draco, TargetFormat::Usdz]
        );
    }

    #[test]
    fn every_source_has_defaults() {
        use strum::IntoEnumIterator;
        for source in SourceFormat::iter() {
            assert!(!default_targets(source).is_empty(), "{source}");
        }
    }

    #[test]
    fn duplicate_targets_collapse() {
        assert_eq!(
            dedupe(&[TargetFormat::Usdz, TargetFormat::Glb, TargetFormat::Usdz]),
            vec![TargetFormat::Usdz, TargetFormat::Glb]
        );
    }
}
