use std::time::Instant;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::model::Asset;

/// Android viewers get textures capped at this edge length.
const ANDROID_TEXTURE_CAP: u32 = 1024;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Platform {
    Ios,
    Android,
    Web,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialReport {
    pub platform: Platform,
    pub optimizations: Vec<String>,
    pub elapsed_ms: u64,
}

/// Describes the material changes each platform needs.
///
/// The report is advisory; scene edits are left to the conversion backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaterialConsolidator;

impl MaterialConsolidator {
    pub fn consolidate(&self, platform: Platform, material_count: u32, texture_count: u32) -> MaterialReport {
        let started = Instant::now();
        let mut optimizations = Vec::new();
        match platform {
            Platform::Ios => {
                optimizations.push(
                    "Convert materials to the metallic-roughness PBR workflow for USDZ".to_owned(),
                );
                if texture_count > 0 {
                    optimizations
                        .push("Embed textures as PNG or JPEG inside the USDZ package".to_owned());
                }
            }
            Platform::Android => {
                optimizations.push("Standardize materials on glTF PBR metallic-roughness".to_owned());
                if texture_count > 0 {
                    optimizations.push(format!(
                        "Cap {texture_count} textures at {ANDROID_TEXTURE_CAP}px for Scene Viewer"
                    ));
                }
            }
            Platform::Web => {
                if material_count > 1 {
                    optimizations.push(format!(
                        "Merge duplicate materials among {material_count} to cut draw calls"
                    ));
                }
                if texture_count > 0 {
                    optimizations.push("Re-encode textures as WebP".to_owned());
                }
            }
        }
        debug!(%platform, count = optimizations.len(), "material report built");
        MaterialReport {
            platform,
            optimizations,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn consolidate_asset(&self, platform: Platform, asset: &Asset) -> MaterialReport {
        self.consolidate(platform, asset.material_count, asset.texture_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_platform_reports_something_for_textured_models() {
        for platform in [Platform::Ios, Platform::Android, Platform::Web] {
            let report = MaterialConsolidator.consolidate(platform, 4, 6);
            assert_eq!(report.platform, platform);
            assert!(!report.optimizations.is_empty(), "{platform}");
        }
    }

    #[test]
    fn android_mentions_texture_cap() {
        let report = MaterialConsolidator.consolidate(Platform::Android, 1, 3);
        assert!(report.optimizations.iter().any(|o| o.contains("1024px")));
    }

    #[test]
    fn web_skips_merge_for_single_material() {
        let report = MaterialConsolidator.consolidate(Platform::Web, 1, 0);
        assert!(report.optimizations.is_empty());
    }

    #[test]
    fn platform_parses_case_insensitively() {
        assert_eq!("iOS".parse::<Platform>().ok(), Some(Platform::Ios));
    }
}
