use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::backend::{BackendOp, ConversionBackend};
use crate::error::PipelineError;
use crate::format::{SourceFormat, TargetFormat};
use crate::stage::{ModelInput, StageOutput, run_backend};
use crate::storage::ObjectStore;

const STAGE: &str = "usdz";

/// Packages a glTF/GLB scene as USDZ.
///
/// Uses the local converter when it is installed and falls back to the
/// hosted service otherwise.
#[derive(Clone)]
pub struct UsdzStage {
    store: Arc<dyn ObjectStore>,
    local: Arc<dyn ConversionBackend>,
    local_timeout: Duration,
    hosted: Option<Arc<dyn ConversionBackend>>,
    hosted_timeout: Duration,
}

impl UsdzStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        local: Arc<dyn ConversionBackend>,
        local_timeout: Duration,
    ) -> Self {
        Self {
            store,
            local,
            local_timeout,
            hosted: None,
            hosted_timeout: local_timeout,
        }
    }

    pub fn with_hosted(mut self, hosted: Arc<dyn ConversionBackend>, timeout: Duration) -> Self {
        self.hosted = Some(hosted);
        self.hosted_timeout = timeout;
        self
    }

    fn select_backend(&self) -> Result<(&dyn ConversionBackend, Duration), PipelineError> {
        if self.local.is_available() {
            return Ok((self.local.as_ref(), self.local_timeout));
        }
        match &self.hosted {
            Some(hosted) if hosted.is_available() => {
                warn!(
                    local = self.local.name(),
                    hosted = hosted.name(),
                    "local USDZ converter unavailable, using hosted service"
                );
                Ok((hosted.as_ref(), self.hosted_timeout))
            }
            _ => Err(PipelineError::backend(
                self.local.name(),
                "no USDZ converter available",
            )),
        }
    }

    pub async fn convert(
        &self,
        input: &ModelInput,
        format: SourceFormat,
    ) -> Result<StageOutput, PipelineError> {
        if !format.is_gltf_family() {
            return Err(PipelineError::UnsupportedFormat(format!(
                "USDZ stage expects glb or gltf, got {format}"
            )));
        }
        let (backend, timeout) = self.select_backend()?;
        run_backend(
            STAGE,
            self.store.as_ref(),
            backend,
            timeout,
            input,
            format,
            BackendOp::ExportUsdz,
            TargetFormat::Usdz,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::stage::GltfStage;
    use crate::storage::memory::MemoryObjectStore;
    use crate::testing::FakeBackend;

    fn glb() -> ModelInput {
        ModelInput::Bytes(Bytes::from_static(b"glTF-binary-scene"))
    }

    #[tokio::test]
    async fn local_converter_is_preferred() {
        let store = Arc::new(MemoryObjectStore::new());
        let local = Arc::new(FakeBackend::new("usd"));
        let hosted = Arc::new(FakeBackend::new("hosted"));
        let stage = UsdzStage::new(store, local.clone(), Duration::from_secs(5))
            .with_hosted(hosted.clone(), Duration::from_secs(5));

        let out = stage.convert(&glb(), SourceFormat::Glb).await.unwrap();
        assert_eq!(out.output_format, TargetFormat::Usdz);
        assert_eq!(out.output_bytes, 17);
        assert_eq!((local.calls(), hosted.calls()), (1, 0));
    }

    #[tokio::test]
    async fn falls_back_to_hosted_when_local_is_missing() {
        let store = Arc::new(MemoryObjectStore::new());
        let local = Arc::new(FakeBackend::new("usd").unavailable());
        let hosted = Arc::new(FakeBackend::new("hosted"));
        let stage = UsdzStage::new(store, local.clone(), Duration::from_secs(5))
            .with_hosted(hosted.clone(), Duration::from_secs(5));

        stage.convert(&glb(), SourceFormat::Glb).await.unwrap();
        assert_eq!((local.calls(), hosted.calls()), (0, 1));
    }

    #[tokio::test]
    async fn no_backend_is_a_backend_error() {
        let store = Arc::new(MemoryObjectStore::new());
        let stage = UsdzStage::new(
            store,
            Arc::new(FakeBackend::new("usd").unavailable()),
            Duration::from_secs(5),
        );
        let err = stage.convert(&glb(), SourceFormat::Glb).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConversionBackendError { .. }));
    }

    #[tokio::test]
    async fn interchange_input_is_rejected() {
        let store = Arc::new(MemoryObjectStore::new());
        let stage = UsdzStage::new(store, Arc::new(FakeBackend::new("usd")), Duration::from_secs(5));
        let err = stage.convert(&glb(), SourceFormat::Fbx).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn empty_artifact_is_no_output() {
        let store = Arc::new(MemoryObjectStore::new());
        let stage = UsdzStage::new(
            store,
            Arc::new(FakeBackend::new("usd").writing_nothing()),
            Duration::from_secs(5),
        );
        let err = stage.convert(&glb(), SourceFormat::Glb).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoOutputProduced { .. }));
    }

    #[tokio::test]
    async fn slow_backend_hits_stage_timeout() {
        let store = Arc::new(MemoryObjectStore::new());
        let backend = Arc::new(FakeBackend::new("blender").delayed(Duration::from_secs(5)));
        let stage = GltfStage::new(store, backend, Duration::from_millis(20));
        let err = stage
            .convert(&glb(), SourceFormat::Fbx, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConversionTimeout { .. }));
    }

    #[tokio::test]
    async fn missing_source_is_download_failure() {
        let store = Arc::new(MemoryObjectStore::new());
        let stage = GltfStage::new(store, Arc::new(FakeBackend::new("blender")), Duration::from_secs(5));
        let err = stage
            .convert(&ModelInput::Uri("memory://gone.fbx".into()), SourceFormat::Fbx, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DownloadFailed { .. }));
    }
}
