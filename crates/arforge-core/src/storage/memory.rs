use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::PipelineError;
use crate::format::TargetFormat;
use crate::model::{Asset, ConversionJob, JobStatus, ValidationStatus};
use crate::storage::{ObjectStore, RecordStore, ValidationOutcome, check_key};

#[derive(Debug, Default)]
struct Records {
    assets: HashMap<String, Asset>,
    jobs: HashMap<String, ConversionJob>,
    /// Job ids in insertion order.
    job_order: Vec<String>,
}

/// In-process record store behind a `tokio::sync::RwLock`.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<Records>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Records {
    fn asset_mut(&mut self, id: &str) -> Result<&mut Asset, PipelineError> {
        self.assets
            .get_mut(id)
            .ok_or_else(|| PipelineError::not_found("asset", id))
    }

    /// Mutable job, or `None` when it is already terminal.
    fn open_job(&mut self, id: &str) -> Result<Option<&mut ConversionJob>, PipelineError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| PipelineError::not_found("conversion job", id))?;
        if job.status.is_terminal() {
            warn!(job_id = id, status = %job.status, "ignoring update to terminal job");
            return Ok(None);
        }
        job.updated_at = Utc::now();
        Ok(Some(job))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert_asset(&self, asset: Asset) -> Result<(), PipelineError> {
        self.inner
            .write()
            .await
            .assets
            .insert(asset.id.clone(), asset);
        Ok(())
    }

    async fn get_asset(&self, id: &str) -> Result<Option<Asset>, PipelineError> {
        Ok(self.inner.read().await.assets.get(id).cloned())
    }

    async fn set_validation_status(
        &self,
        id: &str,
        status: ValidationStatus,
    ) -> Result<(), PipelineError> {
        let mut guard = self.inner.write().await;
        let asset = guard.asset_mut(id)?;
        asset.validation_status = status;
        asset.updated_at = Utc::now();
        Ok(())
    }

    async fn record_validation(
        &self,
        id: &str,
        outcome: ValidationOutcome,
    ) -> Result<(), PipelineError> {
        let mut guard = self.inner.write().await;
        let asset = guard.asset_mut(id)?;
        asset.validation_status = outcome.status;
        asset.validation_errors = outcome.errors;
        asset.load_time = Some(outcome.load_time);
        asset.updated_at = Utc::now();
        Ok(())
    }

    async fn set_format_url(
        &self,
        id: &str,
        target: TargetFormat,
        uri: &str,
    ) -> Result<(), PipelineError> {
        let mut guard = self.inner.write().await;
        let asset = guard.asset_mut(id)?;
        asset.format_urls.insert(target, uri.to_owned());
        asset.updated_at = Utc::now();
        Ok(())
    }

    async fn set_lod_urls(
        &self,
        id: &str,
        lods: BTreeMap<String, String>,
        recommended: Option<String>,
    ) -> Result<(), PipelineError> {
        let mut guard = self.inner.write().await;
        let asset = guard.asset_mut(id)?;
        asset.lod_urls = lods;
        asset.recommended_lod = recommended;
        asset.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_job(&self, job: ConversionJob) -> Result<(), PipelineError> {
        let mut guard = self.inner.write().await;
        if !guard.assets.contains_key(&job.asset_id) {
            return Err(PipelineError::not_found("asset", &job.asset_id));
        }
        guard.job_order.push(job.id.clone());
        guard.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<ConversionJob>, PipelineError> {
        Ok(self.inner.read().await.jobs.get(id).cloned())
    }

    async fn jobs_for_asset(&self, asset_id: &str) -> Result<Vec<ConversionJob>, PipelineError> {
        let guard = self.inner.read().await;
        Ok(guard
            .job_order
            .iter()
            .rev()
            .filter_map(|id| guard.jobs.get(id))
            .filter(|job| job.asset_id == asset_id)
            .cloned()
            .collect())
    }

    async fn mark_job_processing(&self, id: &str, attempt: u32) -> Result<(), PipelineError> {
        let mut guard = self.inner.write().await;
        if let Some(job) = guard.open_job(id)? {
            job.status = JobStatus::Processing;
            job.attempts = attempt;
            job.started_at.get_or_insert(job.updated_at);
        }
        Ok(())
    }

    async fn record_job_error(&self, id: &str, message: &str) -> Result<(), PipelineError> {
        let mut guard = self.inner.write().await;
        if let Some(job) = guard.open_job(id)? {
            job.error = Some(message.to_owned());
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        id: &str,
        output_uri: &str,
        processing_ms: u64,
    ) -> Result<(), PipelineError> {
        let mut guard = self.inner.write().await;
        if let Some(job) = guard.open_job(id)? {
            job.status = JobStatus::Completed;
            job.output_uri = Some(output_uri.to_owned());
            job.processing_ms = Some(processing_ms);
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        id: &str,
        message: &str,
        processing_ms: Option<u64>,
    ) -> Result<(), PipelineError> {
        let mut guard = self.inner.write().await;
        if let Some(job) = guard.open_job(id)? {
            job.status = JobStatus::Failed;
            job.error = Some(message.to_owned());
            job.processing_ms = processing_ms;
        }
        Ok(())
    }
}

const MEMORY_SCHEME: &str = "memory://";

/// In-process object store addressed by `memory://<key>` URIs.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        bytes: Bytes,
        key: &str,
        _content_type: &str,
    ) -> Result<String, PipelineError> {
        check_key(key)?;
        let uri = format!("{MEMORY_SCHEME}{key}");
        self.objects.write().await.insert(uri.clone(), bytes);
        Ok(uri)
    }

    async fn download(&self, uri: &str) -> Result<Bytes, PipelineError> {
        self.objects
            .read()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| PipelineError::DownloadFailed {
                uri: uri.to_owned(),
                message: "no such object".to_owned(),
            })
    }

    async fn head_size(&self, uri: &str) -> Result<Option<u64>, PipelineError> {
        Ok(self
            .objects
            .read()
            .await
            .get(uri)
            .map(|b| b.len() as u64))
    }
}
