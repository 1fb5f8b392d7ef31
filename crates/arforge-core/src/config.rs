use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::tool::ToolKind;
use crate::error::PipelineError;
use crate::optimize::{DracoOptions, TextureOptions};
use crate::validate::ValidationLimits;

/// Pipeline settings, loadable from TOML. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tools: ToolsConfig,
    pub hosted: HostedConfig,
    pub stages: StageConfig,
    pub queues: QueueConfig,
    pub limits: ValidationLimits,
    pub draco: DracoOptions,
    pub texture: TextureOptions,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::InvalidOptions(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, PipelineError> {
        toml::from_str(text).map_err(|e| PipelineError::InvalidOptions(format!("config: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub blender: PathBuf,
    pub usd_converter: PathBuf,
    pub gltfpack: PathBuf,
    pub gltf_transform: PathBuf,
    /// Tool used for simplification and LODs.
    pub simplifier: ToolKind,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            blender: ToolKind::Blender.default_program().into(),
            usd_converter: ToolKind::UsdConverter.default_program().into(),
            gltfpack: ToolKind::Gltfpack.default_program().into(),
            gltf_transform: ToolKind::GltfTransform.default_program().into(),
            simplifier: ToolKind::Gltfpack,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostedConfig {
    /// Hosted USDZ fallback is disabled when unset.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            poll_interval_ms: 3_000,
            max_polls: 120,
        }
    }
}

impl HostedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Polling budget plus a minute for submit and fetch.
    pub fn stage_timeout(&self) -> Duration {
        self.poll_interval() * self.max_polls + Duration::from_secs(60)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub gltf_timeout_secs: u64,
    pub usdz_timeout_secs: u64,
    pub optimize_timeout_secs: u64,
    /// Retained stdout/stderr per tool stream.
    pub max_output_bytes: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            gltf_timeout_secs: 600,
            usdz_timeout_secs: 300,
            optimize_timeout_secs: 300,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl StageConfig {
    pub fn gltf_timeout(&self) -> Duration {
        Duration::from_secs(self.gltf_timeout_secs)
    }

    pub fn usdz_timeout(&self) -> Duration {
        Duration::from_secs(self.usdz_timeout_secs)
    }

    pub fn optimize_timeout(&self) -> Duration {
        Duration::from_secs(self.optimize_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub conversion_workers: usize,
    pub optimization_workers: usize,
    pub conversion_attempts: u32,
    pub optimization_attempts: u32,
    pub backoff_base_ms: u64,
    /// Per-item deadline covering every stage of one attempt.
    pub conversion_timeout_secs: u64,
    pub optimization_timeout_secs: u64,
    pub capacity: usize,
    /// Completed and failed items kept for inspection, per outcome.
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            conversion_workers: 4,
            optimization_workers: 2,
            conversion_attempts: 3,
            optimization_attempts: 2,
            backoff_base_ms: 5_000,
            conversion_timeout_secs: 30 * 60,
            optimization_timeout_secs: 30 * 60,
            capacity: 1024,
            history_limit: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.queues.conversion_attempts, 3);
        assert_eq!(config.queues.optimization_attempts, 2);
        assert_eq!(config.stages.gltf_timeout(), Duration::from_secs(600));
        assert_eq!(config.stages.usdz_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = PipelineConfig::from_toml(
            r#"
            [tools]
            blender = "/opt/blender/blender"
            simplifier = "gltf-transform"

            [hosted]
            endpoint = "https://convert.example"
            max_polls = 10

            [draco]
            compression_level = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.tools.blender, PathBuf::from("/opt/blender/blender"));
        assert_eq!(config.tools.simplifier, ToolKind::GltfTransform);
        assert_eq!(config.hosted.max_polls, 10);
        assert_eq!(config.hosted.poll_interval_ms, 3_000);
        assert_eq!(config.draco.compression_level, 10);
        assert_eq!(config.draco.position_bits, 14);
    }

    #[test]
    fn malformed_toml_is_invalid_options() {
        let err = PipelineConfig::from_toml("[queues\nworkers = ").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOptions(_)));
    }

    #[test]
    fn hosted_timeout_covers_polling_budget() {
        let hosted = HostedConfig::default();
        assert_eq!(hosted.stage_timeout(), Duration::from_secs(3 * 120 + 60));
    }
}
