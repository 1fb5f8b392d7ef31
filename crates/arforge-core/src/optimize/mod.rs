//! Post-conversion optimization: simplification, Draco, textures, LODs and
//! per-platform material advice.

pub mod draco;
pub mod lod;
pub mod material;
pub mod simplify;
pub mod texture;

use bytes::Bytes;
use serde::Serialize;

pub use draco::{DracoEncoder, DracoOptions};
pub use lod::{LodArtifact, LodGenerator, LodLevel};
pub use material::{MaterialConsolidator, MaterialReport, Platform};
pub use simplify::GeometrySimplifier;
pub use texture::{TextureCodec, TextureEncoder, TextureOptions, TextureResult};

/// Outcome of one optimization pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationResult {
    #[serde(skip)]
    pub output: Bytes,
    pub original_size: u64,
    pub optimized_size: u64,
    /// 0 when the backend does not report triangle counts.
    pub original_polygons: u64,
    pub optimized_polygons: u64,
    /// `optimized_size / original_size`.
    pub ratio: f64,
    pub elapsed_ms: u64,
}

impl OptimizationResult {
    pub(crate) fn from_sizes(output: Bytes, original_size: u64, elapsed_ms: u64) -> Self {
        let optimized_size = output.len() as u64;
        Self {
            output,
            original_size,
            optimized_size,
            original_polygons: 0,
            optimized_polygons: 0,
            ratio: size_ratio(original_size, optimized_size),
            elapsed_ms,
        }
    }
}

pub fn size_ratio(original: u64, optimized: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        optimized as f64 / original as f64
    }
}
