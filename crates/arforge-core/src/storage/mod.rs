//! Persistence seams: structured records and binary objects.

pub mod fs;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::PipelineError;
use crate::format::TargetFormat;
use crate::model::{Asset, ConversionJob, LoadTimeEstimate, ValidationStatus};

/// Fields written back by a validation run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub status: ValidationStatus,
    pub errors: Vec<String>,
    pub load_time: LoadTimeEstimate,
}

/// Store for assets and conversion jobs.
///
/// Implementations must make `set_format_url` touch only the named slot so
/// that concurrent jobs for the same asset never overwrite each other, and
/// must ignore job updates once a job is terminal.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_asset(&self, asset: Asset) -> Result<(), PipelineError>;

    async fn get_asset(&self, id: &str) -> Result<Option<Asset>, PipelineError>;

    async fn set_validation_status(
        &self,
        id: &str,
        status: ValidationStatus,
    ) -> Result<(), PipelineError>;

    async fn record_validation(
        &self,
        id: &str,
        outcome: ValidationOutcome,
    ) -> Result<(), PipelineError>;

    async fn set_format_url(
        &self,
        id: &str,
        target: TargetFormat,
        uri: &str,
    ) -> Result<(), PipelineError>;

    async fn set_lod_urls(
        &self,
        id: &str,
        lods: BTreeMap<String, String>,
        recommended: Option<String>,
    ) -> Result<(), PipelineError>;

    async fn insert_job(&self, job: ConversionJob) -> Result<(), PipelineError>;

    async fn get_job(&self, id: &str) -> Result<Option<ConversionJob>, PipelineError>;

    /// Jobs for an asset, newest first.
    async fn jobs_for_asset(&self, asset_id: &str) -> Result<Vec<ConversionJob>, PipelineError>;

    /// Move to `PROCESSING`, record the attempt number and first start time.
    async fn mark_job_processing(&self, id: &str, attempt: u32) -> Result<(), PipelineError>;

    /// Record a failed attempt that will be retried.
    async fn record_job_error(&self, id: &str, message: &str) -> Result<(), PipelineError>;

    async fn complete_job(
        &self,
        id: &str,
        output_uri: &str,
        processing_ms: u64,
    ) -> Result<(), PipelineError>;

    async fn fail_job(
        &self,
        id: &str,
        message: &str,
        processing_ms: Option<u64>,
    ) -> Result<(), PipelineError>;
}

/// Blob storage for source models and produced artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return a URI that `download` accepts.
    async fn upload(&self, bytes: Bytes, key: &str, content_type: &str)
    -> Result<String, PipelineError>;

    async fn download(&self, uri: &str) -> Result<Bytes, PipelineError>;

    /// Size of the object at `uri`, if it exists.
    async fn head_size(&self, uri: &str) -> Result<Option<u64>, PipelineError>;
}

/// Object key for a conversion artifact.
pub fn artifact_key(asset_id: &str, job_id: &str, target: TargetFormat) -> String {
    format!("assets/{asset_id}/{target}/{job_id}.{}", target.extension())
}

/// Object key for a level of detail.
pub fn lod_key(asset_id: &str, level: &str) -> String {
    format!("assets/{asset_id}/lod/{level}.glb")
}

/// Reject keys that could escape a storage root.
pub(crate) fn check_key(key: &str) -> Result<(), PipelineError> {
    let escapes = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part == ".." || part.is_empty());
    if escapes {
        Err(PipelineError::Storage(format!("invalid object key '{key}'")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_keys_are_namespaced_by_asset_and_target() {
        assert_eq!(
            artifact_key("a1", "j1", TargetFormat::Draco),
            "assets/a1/draco/j1.glb"
        );
        assert_eq!(lod_key("a1", "lod1"), "assets/a1/lod/lod1.glb");
    }

    #[test]
    fn traversal_keys_are_rejected() {
        assert!(check_key("assets/a/b.glb").is_ok());
        assert!(check_key("../etc/passwd").is_err());
        assert!(check_key("/abs").is_err());
        assert!(check_key("a//b").is_err());
    }
}
