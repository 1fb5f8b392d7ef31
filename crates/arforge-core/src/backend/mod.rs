//! Conversion backends: local command-line tools and a hosted service.
//!
//! Stages depend only on [`ConversionBackend`]; swapping Blender for another
//! converter is a configuration change.

pub mod hosted;
pub mod process;
pub mod tool;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::format::SourceFormat;
use crate::normalize::CorrectiveTransform;
use crate::optimize::draco::DracoOptions;

/// The work a backend is asked to do on one file.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOp {
    /// Import any supported source and export glTF.
    ExportGltf {
        binary: bool,
        transform: Option<CorrectiveTransform>,
    },
    /// Package a glTF/GLB scene as USDZ.
    ExportUsdz,
    /// Remove `reduction` of the triangles (0.0 keeps all of them).
    Simplify { reduction: f64 },
    DracoEncode(DracoOptions),
}

impl BackendOp {
    pub fn name(&self) -> &'static str {
        match self {
            BackendOp::ExportGltf { .. } => "export-gltf",
            BackendOp::ExportUsdz => "export-usdz",
            BackendOp::Simplify { .. } => "simplify",
            BackendOp::DracoEncode(_) => "draco-encode",
        }
    }
}

/// One backend invocation: read `input`, write `output`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendJob {
    pub input: PathBuf,
    pub input_format: SourceFormat,
    pub output: PathBuf,
    pub op: BackendOp,
}

#[async_trait]
pub trait ConversionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend can currently be used (tool found, endpoint set).
    fn is_available(&self) -> bool;

    /// Produce `job.output`. Success does not guarantee the file is non-empty;
    /// callers verify the artifact.
    async fn run(&self, job: &BackendJob) -> Result<(), PipelineError>;
}
