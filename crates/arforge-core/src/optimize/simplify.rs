use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use crate::backend::{BackendOp, ConversionBackend};
use crate::error::PipelineError;
use crate::format::{SourceFormat, TargetFormat};
use crate::optimize::OptimizationResult;
use crate::stage::workspace::resolve_input;
use crate::stage::{ModelInput, run_backend};
use crate::storage::ObjectStore;

const STAGE: &str = "simplify";

/// Reduces triangle count of glTF-family models.
#[derive(Clone)]
pub struct GeometrySimplifier {
    store: Arc<dyn ObjectStore>,
    backend: Arc<dyn ConversionBackend>,
    timeout: Duration,
}

impl GeometrySimplifier {
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

    /// Fetch the bytes behind an input once, for callers making several passes.
    pub async fn fetch(&self, input: &ModelInput) -> Result<Bytes, PipelineError> {
        resolve_input(self.store.as_ref(), input).await
    }

    /// Remove `reduction` (0.0..=1.0) of the triangles.
    ///
    /// A reduction of 0 still runs the backend, which repacks the file.
    pub async fn simplify(
        &self,
        input: &ModelInput,
        format: SourceFormat,
        reduction: f64,
    ) -> Result<OptimizationResult, PipelineError> {
        if !(0.0..=1.0).contains(&reduction) {
            return Err(PipelineError::InvalidOptions(format!(
                "reduction {reduction} is outside 0.0..=1.0"
            )));
        }
        if !format.is_gltf_family() {
            return Err(PipelineError::UnsupportedFormat(format!(
                "simplification expects glb or gltf, got {format}"
            )));
        }
        let output_format = if format == SourceFormat::Gltf {
            TargetFormat::Gltf
        } else {
            TargetFormat::Glb
        };
        let out = run_backend(
            STAGE,
            self.store.as_ref(),
            self.backend.as_ref(),
            self.timeout,
            input,
            format,
            BackendOp::Simplify { reduction },
            output_format,
        )
        .await?;
        let result = OptimizationResult::from_sizes(out.bytes, out.input_bytes, out.elapsed_ms);
        info!(
            reduction,
            original = result.original_size,
            simplified = result.optimized_size,
            "geometry simplified"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryObjectStore;
    use crate::testing::FakeBackend;

    fn simplifier() -> GeometrySimplifier {
        GeometrySimplifier::new(
            Arc::new(MemoryObjectStore::new()),
            Arc::new(FakeBackend::new("gltfpack")),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn reduction_shrinks_output() {
        let input = ModelInput::Bytes(Bytes::from(vec![1u8; 100]));
        let result = simplifier()
            .simplify(&input, SourceFormat::Glb, 0.8)
            .await
            .unwrap();
        assert_eq!(result.original_size, 100);
        assert_eq!(result.optimized_size, 20);
        assert!((result.ratio - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reduction_must_be_a_fraction() {
        let input = ModelInput::Bytes(Bytes::from_static(b"glTF"));
        for bad in [-0.1, 1.5, f64::NAN] {
            let err = simplifier()
                .simplify(&input, SourceFormat::Glb, bad)
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::InvalidOptions(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn non_gltf_sources_are_refused() {
        let input = ModelInput::Bytes(Bytes::from_static(b"solid"));
        let err = simplifier()
            .simplify(&input, SourceFormat::Stl, 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }
}
