use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendOp, ConversionBackend};
use crate::error::PipelineError;
use crate::format::{SourceFormat, TargetFormat};
use crate::normalize::CorrectiveTransform;
use crate::stage::{ModelInput, StageOutput, run_backend};
use crate::storage::ObjectStore;

const STAGE: &str = "gltf";

/// Converts any accepted source into GLB or glTF.
#[derive(Clone)]
pub struct GltfStage {
    store: Arc<dyn ObjectStore>,
    backend: Arc<dyn ConversionBackend>,
    timeout: Duration,
}

impl GltfStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        backend: Arc<dyn ConversionBackend>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            timeout,
        }
    }

    pub async fn convert(
        &self,
        input: &ModelInput,
        format: SourceFormat,
        binary: bool,
        transform: Option<CorrectiveTransform>,
    ) -> Result<StageOutput, PipelineError> {
        let output_format = if binary {
            TargetFormat::Glb
        } else {
            TargetFormat::Gltf
        };
        run_backend(
            STAGE,
            self.store.as_ref(),
            self.backend.as_ref(),
            self.timeout,
            input,
            format,
            BackendOp::ExportGltf { binary, transform },
            output_format,
        )
        .await
    }
}
