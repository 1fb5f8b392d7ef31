//! Wiring of stores, backends, stages and queues behind one handle.
//!
//! # Usage
//!
//! ```rust,ignore
//! let pipeline = Pipeline::from_config(config, records, objects);
//! let _workers = pipeline.start_workers();
//! let asset = pipeline.import(request).await?;
//! pipeline.request_conversion(&asset.id, &[], ConversionOptions::default()).await?;
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::ConversionBackend;
use crate::backend::hosted::{HostedBackend, HttpConversionApi};
use crate::backend::tool::{ToolBackend, ToolKind};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::format::{TargetFormat, from_mime, parse_extension};
use crate::model::{Asset, BoundingBox, JobId};
use crate::optimize::{DracoEncoder, GeometrySimplifier, TextureEncoder};
use crate::runtime::jobs::{JobRuntime, Stages};
use crate::runtime::orchestrator::ConversionOrchestrator;
use crate::runtime::queue::{EnqueueOptions, QueueSnapshot, WorkQueue, WorkerPool};
use crate::runtime::types::{ConversionOptions, ConversionStatus, ConversionWork, OptimizationWork};
use crate::stage::{GltfStage, UsdzStage};
use crate::storage::{ObjectStore, RecordStore};
use crate::validate::{ReadinessValidator, ValidationReport};

pub const CONVERSION_QUEUE: &str = "model-conversion";
pub const OPTIMIZATION_QUEUE: &str = "model-optimization";

/// Backends for each role.
#[derive(Clone)]
pub struct Backends {
    pub gltf: Arc<dyn ConversionBackend>,
    pub usdz: Arc<dyn ConversionBackend>,
    pub usdz_fallback: Option<Arc<dyn ConversionBackend>>,
    pub simplifier: Arc<dyn ConversionBackend>,
    pub draco: Arc<dyn ConversionBackend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendAvailability {
    pub role: &'static str,
    pub backend: String,
    pub available: bool,
}

impl Backends {
    /// Command-line tools from config, plus the hosted fallback if configured.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let tools = &config.tools;
        let stages = &config.stages;
        let tool = |kind: ToolKind, program: &Path, timeout: Duration| -> Arc<dyn ConversionBackend> {
            Arc::new(
                ToolBackend::new(kind, program, timeout).with_max_output_bytes(stages.max_output_bytes),
            )
        };

        let simplifier = match tools.simplifier {
            ToolKind::GltfTransform => tool(
                ToolKind::GltfTransform,
                &tools.gltf_transform,
                stages.optimize_timeout(),
            ),
            _ => tool(ToolKind::Gltfpack, &tools.gltfpack, stages.optimize_timeout()),
        };

        let usdz_fallback = config.hosted.endpoint.as_ref().map(|endpoint| {
            let api = HttpConversionApi::new(endpoint.clone(), config.hosted.api_key.clone());
            Arc::new(HostedBackend::new(
                Arc::new(api),
                config.hosted.poll_interval(),
                config.hosted.max_polls,
            )) as Arc<dyn ConversionBackend>
        });

        Self {
            gltf: tool(ToolKind::Blender, &tools.blender, stages.gltf_timeout()),
            usdz: tool(ToolKind::UsdConverter, &tools.usd_converter, stages.usdz_timeout()),
            usdz_fallback,
            simplifier,
            draco: tool(
                ToolKind::GltfTransform,
                &tools.gltf_transform,
                stages.optimize_timeout(),
            ),
        }
    }

    pub fn availability(&self) -> Vec<BackendAvailability> {
        let mut roles = vec![
            ("gltf", &self.gltf),
            ("usdz", &self.usdz),
            ("simplify", &self.simplifier),
            ("draco", &self.draco),
        ];
        if let Some(fallback) = &self.usdz_fallback {
            roles.push(("usdz-fallback", fallback));
        }
        roles
            .into_iter()
            .map(|(role, backend)| BackendAvailability {
                role,
                backend: backend.name().to_owned(),
                available: backend.is_available(),
            })
            .collect()
    }
}

/// A new upload.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub project_id: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
    pub poly_count: u64,
    pub material_count: u32,
    pub texture_count: u32,
    pub bounding_box: Option<BoundingBox>,
    /// Buffers and images a `.gltf` references, keyed by their relative URI.
    pub resources: Vec<(String, Bytes)>,
}

fn object_file_name(file_name: &str) -> String {
    let name: String = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.trim_matches('.').is_empty() {
        "source".to_owned()
    } else {
        name
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    backends: Backends,
    validator: ReadinessValidator,
    orchestrator: ConversionOrchestrator,
    conversions: WorkQueue<ConversionWork>,
    optimizations: WorkQueue<OptimizationWork>,
    runtime: Arc<JobRuntime>,
}

impl Pipeline {
    pub fn from_config(
        config: PipelineConfig,
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let backends = Backends::from_config(&config);
        Self::new(config, backends, records, objects)
    }

    pub fn new(
        config: PipelineConfig,
        backends: Backends,
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let queues = &config.queues;
        let backoff = Duration::from_millis(queues.backoff_base_ms);
        let conversions = WorkQueue::new(
            CONVERSION_QUEUE,
            queues.capacity,
            EnqueueOptions::new(queues.conversion_attempts, backoff)
                .with_timeout(Duration::from_secs(queues.conversion_timeout_secs)),
            queues.history_limit,
        );
        let optimizations = WorkQueue::new(
            OPTIMIZATION_QUEUE,
            queues.capacity,
            EnqueueOptions::new(queues.optimization_attempts, backoff)
                .with_timeout(Duration::from_secs(queues.optimization_timeout_secs)),
            queues.history_limit,
        );

        let stages_cfg = &config.stages;
        let mut usdz = UsdzStage::new(
            Arc::clone(&objects),
            Arc::clone(&backends.usdz),
            stages_cfg.usdz_timeout(),
        );
        if let Some(fallback) = &backends.usdz_fallback {
            usdz = usdz.with_hosted(Arc::clone(fallback), config.hosted.stage_timeout());
        }
        let stages = Stages {
            gltf: GltfStage::new(
                Arc::clone(&objects),
                Arc::clone(&backends.gltf),
                stages_cfg.gltf_timeout(),
            ),
            usdz,
            simplifier: GeometrySimplifier::new(
                Arc::clone(&objects),
                Arc::clone(&backends.simplifier),
                stages_cfg.optimize_timeout(),
            ),
            draco: DracoEncoder::new(
                Arc::clone(&objects),
                Arc::clone(&backends.draco),
                stages_cfg.optimize_timeout(),
            ),
            draco_options: config.draco,
        };

        let runtime = Arc::new(JobRuntime::new(
            Arc::clone(&records),
            Arc::clone(&objects),
            stages,
        ));
        let orchestrator = ConversionOrchestrator::new(
            Arc::clone(&records),
            conversions.clone(),
            optimizations.clone(),
        );
        let validator = ReadinessValidator::new(Arc::clone(&records), config.limits.clone());

        Self {
            config,
            records,
            objects,
            backends,
            validator,
            orchestrator,
            conversions,
            optimizations,
            runtime,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Store the upload and register a `PENDING` asset for it.
    ///
    /// The format comes from the extension, or from the content type when
    /// the extension is not recognised.
    pub async fn import(&self, request: ImportRequest) -> Result<Asset, PipelineError> {
        let mut asset = Asset::new(
            request.project_id,
            request.file_name.clone(),
            request.bytes.len() as u64,
            String::new(),
        )
        .with_geometry(request.poly_count, request.material_count, request.texture_count);
        if let Some(bbox) = request.bounding_box {
            asset = asset.with_bounding_box(bbox);
        }
        if parse_extension(&asset.original_format).is_none()
            && let Some(format) = request.content_type.as_deref().and_then(from_mime)
        {
            asset.original_format = format.to_string();
        }

        let key = format!("uploads/{}/{}", asset.id, object_file_name(&request.file_name));
        let content_type = request
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        asset.original_uri = self.objects.upload(request.bytes, &key, content_type).await?;
        for (relative, bytes) in request.resources {
            let key = format!("uploads/{}/{relative}", asset.id);
            self.objects
                .upload(bytes, &key, "application/octet-stream")
                .await?;
        }

        self.records.insert_asset(asset.clone()).await?;
        info!(
            asset_id = %asset.id,
            format = %asset.original_format,
            size = asset.original_size,
            "asset imported"
        );
        Ok(asset)
    }

    pub async fn get_asset(&self, asset_id: &str) -> Result<Asset, PipelineError> {
        self.records
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("asset", asset_id))
    }

    pub async fn validate_asset(&self, asset_id: &str) -> Result<ValidationReport, PipelineError> {
        self.validator.validate_asset(asset_id).await
    }

    pub async fn request_conversion(
        &self,
        asset_id: &str,
        targets: &[TargetFormat],
        options: ConversionOptions,
    ) -> Result<Vec<JobId>, PipelineError> {
        self.orchestrator
            .request_conversion(asset_id, targets, options)
            .await
    }

    pub async fn get_conversion_status(&self, asset_id: &str) -> Result<ConversionStatus, PipelineError> {
        self.orchestrator.get_status(asset_id).await
    }

    pub fn texture_encoder(&self) -> Result<TextureEncoder, PipelineError> {
        TextureEncoder::new(self.config.texture)
    }

    /// Start worker pools for both queues.
    pub fn start_workers(&self) -> WorkerPool {
        let queues = &self.config.queues;
        let conversion = self
            .conversions
            .process(self.runtime.clone(), queues.conversion_workers);
        let optimization = self
            .optimizations
            .process(self.runtime.clone(), queues.optimization_workers);
        info!(
            conversion_workers = conversion.len(),
            optimization_workers = optimization.len(),
            "workers started"
        );
        conversion.merge(optimization)
    }

    pub fn is_idle(&self) -> bool {
        self.conversions.is_idle() && self.optimizations.is_idle()
    }

    pub fn queue_snapshots(&self) -> Vec<QueueSnapshot> {
        vec![self.conversions.snapshot(), self.optimizations.snapshot()]
    }

    /// Fail the asset's unfinished jobs.
    ///
    /// Queues live in process memory, so a job left `PENDING` or `PROCESSING`
    /// by an earlier process has no worker coming for it. Call this before
    /// this pipeline queues anything for the asset.
    pub async fn fail_orphaned_jobs(&self, asset_id: &str) -> Result<usize, PipelineError> {
        let mut failed = 0;
        for job in self.records.jobs_for_asset(asset_id).await? {
            if job.status.is_terminal() {
                continue;
            }
            self.records
                .fail_job(&job.id, "interrupted before completion", None)
                .await?;
            warn!(job_id = %job.id, asset_id, status = %job.status, "orphaned job failed");
            failed += 1;
        }
        Ok(failed)
    }

    /// Poll until the given jobs are terminal and both queues are idle.
    ///
    /// The returned status covers only `job_ids`.
    pub async fn wait_until_settled(
        &self,
        asset_id: &str,
        job_ids: &[JobId],
        poll: Duration,
    ) -> Result<ConversionStatus, PipelineError> {
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            let status = self.requested_status(asset_id, job_ids).await?;
            let jobs_done = status.jobs.iter().all(|j| j.status.is_terminal());
            if jobs_done && self.is_idle() {
                return Ok(status);
            }
        }
    }

    /// Status restricted to the jobs of one request.
    pub async fn requested_status(
        &self,
        asset_id: &str,
        job_ids: &[JobId],
    ) -> Result<ConversionStatus, PipelineError> {
        let status = self.get_conversion_status(asset_id).await?;
        let jobs = status
            .jobs
            .into_iter()
            .filter(|job| job_ids.contains(&job.id))
            .collect();
        Ok(ConversionStatus::new(status.asset_id, jobs))
    }
}
