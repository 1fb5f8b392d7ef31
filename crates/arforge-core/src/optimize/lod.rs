use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;
use crate::format::SourceFormat;
use crate::optimize::{GeometrySimplifier, OptimizationResult};
use crate::stage::ModelInput;

/// One rung of a level-of-detail ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LodLevel {
    pub name: String,
    /// Fraction of triangles removed; 0 keeps the source untouched.
    pub reduction: f64,
}

impl LodLevel {
    pub fn new(name: impl Into<String>, reduction: f64) -> Self {
        Self {
            name: name.into(),
            reduction,
        }
    }
}

/// Full detail, half and one fifth of the triangles.
pub fn default_ladder() -> Vec<LodLevel> {
    vec![
        LodLevel::new("lod0", 0.0),
        LodLevel::new("lod1", 0.5),
        LodLevel::new("lod2", 0.8),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct LodArtifact {
    pub level: LodLevel,
    pub result: OptimizationResult,
}

/// The level to serve by default: the second rung, or the only one.
pub fn recommended_level(artifacts: &[LodArtifact]) -> Option<&str> {
    artifacts
        .get(1)
        .or_else(|| artifacts.first())
        .map(|a| a.level.name.as_str())
}

#[derive(Clone)]
pub struct LodGenerator {
    simplifier: GeometrySimplifier,
}

impl LodGenerator {
    pub fn new(simplifier: GeometrySimplifier) -> Self {
        Self { simplifier }
    }

    /// Produce one artifact per level, in ladder order.
    ///
    /// Any failing level fails the whole ladder.
    pub async fn generate(
        &self,
        input: &ModelInput,
        format: SourceFormat,
        ladder: &[LodLevel],
    ) -> Result<Vec<LodArtifact>, PipelineError> {
        if ladder.is_empty() {
            return Err(PipelineError::InvalidOptions("empty LOD ladder".to_owned()));
        }
        let source = self.simplifier.fetch(input).await?;
        let source_input = ModelInput::Bytes(source.clone());

        let mut artifacts = Vec::with_capacity(ladder.len());
        for level in ladder {
            let result = if level.reduction <= 0.0 {
                OptimizationResult::from_sizes(source.clone(), source.len() as u64, 0)
            } else {
                self.simplifier
                    .simplify(&source_input, format, level.reduction)
                    .await?
            };
            info!(
                level = %level.name,
                reduction = level.reduction,
                size = result.optimized_size,
                "lod generated"
            );
            artifacts.push(LodArtifact {
                level: level.clone(),
                result,
            });
        }
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::storage::memory::MemoryObjectStore;
    use crate::testing::FakeBackend;

    fn generator(backend: Arc<FakeBackend>) -> LodGenerator {
        LodGenerator::new(GeometrySimplifier::new(
            Arc::new(MemoryObjectStore::new()),
            backend,
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn default_ladder_yields_three_shrinking_levels() {
        let backend = Arc::new(FakeBackend::new("gltfpack"));
        let input = ModelInput::Bytes(Bytes::from(vec![0u8; 1000]));
        let artifacts = generator(backend.clone())
            .generate(&input, SourceFormat::Glb, &default_ladder())
            .await
            .unwrap();

        let sizes: Vec<_> = artifacts.iter().map(|a| a.result.optimized_size).collect();
        assert_eq!(sizes, vec![1000, 500, 200]);
        assert_eq!(recommended_level(&artifacts), Some("lod1"));
        // lod0 is a passthrough
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn single_level_is_recommended() {
        let input = ModelInput::Bytes(Bytes::from(vec![0u8; 10]));
        let artifacts = generator(Arc::new(FakeBackend::new("gltfpack")))
            .generate(&input, SourceFormat::Glb, &[LodLevel::new("only", 0.3)])
            .await
            .unwrap();
        assert_eq!(recommended_level(&artifacts), Some("only"));
    }

    #[tokio::test]
    async fn failing_level_fails_the_ladder() {
        let backend = Arc::new(
            FakeBackend::new("gltfpack").failing(1, PipelineError::backend("gltfpack", "crash")),
        );
        let input = ModelInput::Bytes(Bytes::from(vec![0u8; 10]));
        let err = generator(backend)
            .generate(&input, SourceFormat::Glb, &default_ladder())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn empty_artifact_list_has_no_recommendation() {
        assert_eq!(recommended_level(&[]), None);
    }
}
