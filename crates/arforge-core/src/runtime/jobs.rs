//! Queue handlers: execute conversion jobs and LOD ladders.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::format::{SourceFormat, TargetFormat};
use crate::model::ConversionJob;
use crate::optimize::lod::recommended_level;
use crate::optimize::{DracoEncoder, DracoOptions, GeometrySimplifier, LodGenerator};
use crate::runtime::queue::{JobHandler, QueuedItem};
use crate::runtime::types::{ConversionWork, OptimizationWork};
use crate::stage::workspace::resolve_input;
use crate::stage::{GltfStage, ModelInput, StageOutput, UsdzStage};
use crate::storage::{ObjectStore, RecordStore, artifact_key, lod_key};

/// Stages a [`JobRuntime`] drives.
#[derive(Clone)]
pub struct Stages {
    pub gltf: GltfStage,
    pub usdz: UsdzStage,
    pub simplifier: GeometrySimplifier,
    pub draco: DracoEncoder,
    pub draco_options: DracoOptions,
}

/// Executes queued work against the stages and persists the results.
pub struct JobRuntime {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    stages: Stages,
    lods: LodGenerator,
}

impl JobRuntime {
    pub fn new(records: Arc<dyn RecordStore>, objects: Arc<dyn ObjectStore>, stages: Stages) -> Self {
        let lods = LodGenerator::new(stages.simplifier.clone());
        Self {
            records,
            objects,
            stages,
            lods,
        }
    }

    async fn require_job(&self, job_id: &str) -> Result<ConversionJob, PipelineError> {
        self.records
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("conversion job", job_id))
    }

    /// The source as GLB: passthrough for GLB sources, otherwise via the glTF stage.
    async fn source_as_glb(&self, work: &ConversionWork) -> Result<StageOutput, PipelineError> {
        let input = ModelInput::Uri(work.source_uri.clone());
        if work.source_format == SourceFormat::Glb && work.transform.is_none() {
            return self.passthrough(&input, TargetFormat::Glb).await;
        }
        self.stages
            .gltf
            .convert(&input, work.source_format, true, work.transform)
            .await
    }

    async fn passthrough(
        &self,
        input: &ModelInput,
        format: TargetFormat,
    ) -> Result<StageOutput, PipelineError> {
        let bytes = resolve_input(self.objects.as_ref(), input).await?;
        let size = bytes.len() as u64;
        Ok(StageOutput {
            bytes,
            input_bytes: size,
            output_bytes: size,
            elapsed_ms: 0,
            output_format: format,
        })
    }

    /// Run the stage chain that yields `work.target_format`.
    async fn produce(&self, work: &ConversionWork) -> Result<StageOutput, PipelineError> {
        let source = ModelInput::Uri(work.source_uri.clone());
        match work.target_format {
            TargetFormat::Glb => {
                let glb = self.source_as_glb(work).await?;
                if !work.optimize {
                    return Ok(glb);
                }
                let packed = self
                    .stages
                    .simplifier
                    .simplify(&ModelInput::Bytes(glb.bytes), SourceFormat::Glb, 0.0)
                    .await?;
                Ok(StageOutput {
                    input_bytes: glb.input_bytes,
                    output_bytes: packed.optimized_size,
                    bytes: packed.output,
                    elapsed_ms: glb.elapsed_ms + packed.elapsed_ms,
                    output_format: TargetFormat::Glb,
                })
            }
            TargetFormat::Gltf => {
                if work.source_format == SourceFormat::Gltf && work.transform.is_none() {
                    return self.passthrough(&source, TargetFormat::Gltf).await;
                }
                self.stages
                    .gltf
                    .convert(&source, work.source_format, false, work.transform)
                    .await
            }
            TargetFormat::Draco => {
                let (input, format, prior_ms) = if work.source_format.is_gltf_family()
                    && work.transform.is_none()
                {
                    (source, work.source_format, 0)
                } else {
                    let glb = self.source_as_glb(work).await?;
                    (ModelInput::Bytes(glb.bytes), SourceFormat::Glb, glb.elapsed_ms)
                };
                let encoded = self
                    .stages
                    .draco
                    .encode(&input, format, &self.stages.draco_options)
                    .await?;
                Ok(StageOutput {
                    input_bytes: encoded.original_size,
                    output_bytes: encoded.optimized_size,
                    bytes: encoded.output,
                    elapsed_ms: prior_ms + encoded.elapsed_ms,
                    output_format: TargetFormat::Draco,
                })
            }
            TargetFormat::Usdz => {
                if work.source_format == SourceFormat::Usdz {
                    return self.passthrough(&source, TargetFormat::Usdz).await;
                }
                if work.source_format.is_gltf_family() && work.transform.is_none() {
                    return self.stages.usdz.convert(&source, work.source_format).await;
                }
                let glb = self.source_as_glb(work).await?;
                let mut usdz = self
                    .stages
                    .usdz
                    .convert(&ModelInput::Bytes(glb.bytes), SourceFormat::Glb)
                    .await?;
                usdz.elapsed_ms += glb.elapsed_ms;
                Ok(usdz)
            }
        }
    }

    async fn run_conversion(&self, item: &QueuedItem<ConversionWork>) -> Result<(), PipelineError> {
        let work = &item.payload;
        let job = self.require_job(&work.job_id).await?;
        if job.status.is_terminal() {
            warn!(job_id = %job.id, status = %job.status, "skipping finished job");
            return Ok(());
        }
        self.records
            .mark_job_processing(&work.job_id, item.attempt)
            .await?;
        info!(
            job_id = %work.job_id,
            asset_id = %work.asset_id,
            target = %work.target_format,
            attempt = item.attempt,
            "conversion started"
        );

        let output = self.produce(work).await?;
        let key = artifact_key(&work.asset_id, &work.job_id, work.target_format);
        let uri = self
            .objects
            .upload(output.bytes, &key, work.target_format.content_type())
            .await?;
        self.records
            .set_format_url(&work.asset_id, work.target_format, &uri)
            .await?;

        let processing_ms = self
            .records
            .get_job(&work.job_id)
            .await?
            .and_then(|job| job.elapsed_ms(Utc::now()))
            .unwrap_or(output.elapsed_ms);
        self.records
            .complete_job(&work.job_id, &uri, processing_ms)
            .await?;
        info!(
            job_id = %work.job_id,
            target = %work.target_format,
            output_bytes = output.output_bytes,
            processing_ms,
            uri = %uri,
            "conversion completed"
        );
        Ok(())
    }

    /// Pick the model the LOD ladder starts from.
    ///
    /// Always derived from the source with the request's transform, so the
    /// ladder matches the converted artifacts whichever job finishes first.
    /// The ladder passes bytes between levels, so a `.gltf` with external
    /// resources is packed into a GLB first.
    async fn lod_source(&self, work: &OptimizationWork) -> Result<(ModelInput, SourceFormat), PipelineError> {
        let source = ModelInput::Uri(work.source_uri.clone());
        if work.source_format == SourceFormat::Glb && work.transform.is_none() {
            return Ok((source, work.source_format));
        }
        let glb = self
            .stages
            .gltf
            .convert(&source, work.source_format, true, work.transform)
            .await?;
        Ok((ModelInput::Bytes(glb.bytes), SourceFormat::Glb))
    }

    async fn run_lods(&self, item: &QueuedItem<OptimizationWork>) -> Result<(), PipelineError> {
        let work = &item.payload;
        let (input, format) = self.lod_source(work).await?;
        let artifacts = self.lods.generate(&input, format, &work.levels).await?;

        let mut urls = BTreeMap::new();
        for artifact in &artifacts {
            let uri = self
                .objects
                .upload(
                    artifact.result.output.clone(),
                    &lod_key(&work.asset_id, &artifact.level.name),
                    TargetFormat::Glb.content_type(),
                )
                .await?;
            urls.insert(artifact.level.name.clone(), uri);
        }
        let recommended = recommended_level(&artifacts).map(str::to_owned);
        self.records
            .set_lod_urls(&work.asset_id, urls, recommended.clone())
            .await?;
        info!(
            asset_id = %work.asset_id,
            levels = artifacts.len(),
            recommended = ?recommended,
            "lods generated"
        );
        Ok(())
    }

    async fn processing_ms(&self, job_id: &str) -> Option<u64> {
        match self.records.get_job(job_id).await {
            Ok(job) => job.and_then(|j| j.elapsed_ms(Utc::now())),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl JobHandler<ConversionWork> for JobRuntime {
    async fn handle(&self, item: &QueuedItem<ConversionWork>) -> Result<(), PipelineError> {
        self.run_conversion(item).await
    }

    async fn on_retry(&self, item: &QueuedItem<ConversionWork>, err: &PipelineError, delay: Duration) {
        let job_id = &item.payload.job_id;
        if let Err(e) = self.records.record_job_error(job_id, &err.to_string()).await {
            error!(job_id = %job_id, error = %e, "failed to record attempt error");
        }
        info!(
            job_id = %job_id,
            attempt = item.attempt,
            retry_in_ms = delay.as_millis() as u64,
            "conversion will be retried"
        );
    }

    async fn on_failed(&self, item: &QueuedItem<ConversionWork>, err: &PipelineError) {
        let job_id = &item.payload.job_id;
        let processing_ms = self.processing_ms(job_id).await;
        if let Err(e) = self
            .records
            .fail_job(job_id, &err.to_string(), processing_ms)
            .await
        {
            error!(job_id = %job_id, error = %e, "failed to mark job failed");
        }
        error!(
            job_id = %job_id,
            target = %item.payload.target_format,
            attempts = item.attempt,
            error = %err,
            "conversion failed"
        );
    }
}

#[async_trait]
impl JobHandler<OptimizationWork> for JobRuntime {
    async fn handle(&self, item: &QueuedItem<OptimizationWork>) -> Result<(), PipelineError> {
        self.run_lods(item).await
    }

    async fn on_failed(&self, item: &QueuedItem<OptimizationWork>, err: &PipelineError) {
        error!(
            asset_id = %item.payload.asset_id,
            attempts = item.attempt,
            error = %err,
            "lod generation failed"
        );
    }
}
