use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{BackendOp, ConversionBackend};
use crate::error::PipelineError;
use crate::format::{SourceFormat, TargetFormat};
use crate::optimize::OptimizationResult;
use crate::stage::{ModelInput, run_backend};
use crate::storage::ObjectStore;

const STAGE: &str = "draco";

/// Draco encoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DracoOptions {
    /// 0 (fastest) to 10 (smallest).
    pub compression_level: u8,
    pub position_bits: u8,
    pub normal_bits: u8,
    pub texcoord_bits: u8,
}

impl Default for DracoOptions {
    fn default() -> Self {
        Self {
            compression_level: 7,
            position_bits: 14,
            normal_bits: 10,
            texcoord_bits: 12,
        }
    }
}

impl DracoOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.compression_level > 10 {
            return Err(PipelineError::InvalidOptions(format!(
                "compression level {} is outside 0..=10",
                self.compression_level
            )));
        }
        for (name, bits) in [
            ("position", self.position_bits),
            ("normal", self.normal_bits),
            ("texcoord", self.texcoord_bits),
        ] {
            if !(1..=30).contains(&bits) {
                return Err(PipelineError::InvalidOptions(format!(
                    "{name} quantization of {bits} bits is outside 1..=30"
                )));
            }
        }
        Ok(())
    }
}

/// Draco-compresses glTF-family models.
#[derive(Clone)]
pub struct DracoEncoder {
    store: Arc<dyn ObjectStore>,
    backend: Arc<dyn ConversionBackend>,
    timeout: Duration,
}

impl DracoEncoder {
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

    pub async fn encode(
        &self,
        input: &ModelInput,
        format: SourceFormat,
        options: &DracoOptions,
    ) -> Result<OptimizationResult, PipelineError> {
        options.validate()?;
        if !format.is_gltf_family() {
            return Err(PipelineError::UnsupportedFormat(format!(
                "Draco expects glb or gltf, got {format}"
            )));
        }
        let out = run_backend(
            STAGE,
            self.store.as_ref(),
            self.backend.as_ref(),
            self.timeout,
            input,
            format,
            BackendOp::DracoEncode(*options),
            TargetFormat::Draco,
        )
        .await?;
        let result = OptimizationResult::from_sizes(out.bytes, out.input_bytes, out.elapsed_ms);
        info!(
            level = options.compression_level,
            original = result.original_size,
            compressed = result.optimized_size,
            ratio = result.ratio,
            "draco encoded"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::storage::memory::MemoryObjectStore;
    use crate::testing::FakeBackend;

    fn encoder(backend: Arc<FakeBackend>) -> DracoEncoder {
        DracoEncoder::new(Arc::new(MemoryObjectStore::new()), backend, Duration::from_secs(5))
    }

    #[test]
    fn default_options_are_valid() {
        assert!(DracoOptions::default().validate().is_ok());
    }

    #[tokio::test]
    async fn compression_ratio_is_output_over_input() {
        let backend = Arc::new(FakeBackend::new("gltf-transform"));
        let input = ModelInput::Bytes(Bytes::from(vec![7u8; 1000]));
        let result = encoder(backend.clone())
            .encode(&input, SourceFormat::Glb, &DracoOptions::default())
            .await
            .unwrap();
        assert_eq!(result.original_size, 1000);
        assert_eq!(result.optimized_size, 500);
        assert_eq!(result.ratio, 0.5);
        assert_eq!(
            backend.ops(),
            vec![BackendOp::DracoEncode(DracoOptions::default())]
        );
    }

    #[tokio::test]
    async fn out_of_range_level_is_rejected_before_running() {
        let backend = Arc::new(FakeBackend::new("gltf-transform"));
        let options = DracoOptions {
            compression_level: 11,
            ..DracoOptions::default()
        };
        let err = encoder(backend.clone())
            .encode(&ModelInput::Bytes(Bytes::from_static(b"x")), SourceFormat::Glb, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOptions(_)));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn empty_compressed_output_fails() {
        let backend = Arc::new(FakeBackend::new("gltf-transform").writing_nothing());
        let err = encoder(backend)
            .encode(
                &ModelInput::Bytes(Bytes::from_static(b"glTF")),
                SourceFormat::Glb,
                &DracoOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoOutputProduced { .. }));
    }
}
