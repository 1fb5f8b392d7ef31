//! Conversion stages: fetch a model into a scratch workspace, hand it to a
//! backend under a timeout, and collect the verified artifact.

pub mod gltf;
pub mod usdz;
pub mod workspace;

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use crate::backend::{BackendJob, BackendOp, ConversionBackend};
use crate::error::PipelineError;
use crate::format::{SourceFormat, TargetFormat};
use crate::storage::ObjectStore;

pub use gltf::GltfStage;
pub use usdz::UsdzStage;
pub use workspace::{ModelInput, ScratchWorkspace};

/// A verified stage artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub bytes: Bytes,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub elapsed_ms: u64,
    pub output_format: TargetFormat,
}

/// Run one backend operation in a fresh workspace.
///
/// Only the backend call is bounded by `timeout`; fetching the input is not.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_backend(
    stage: &str,
    store: &dyn ObjectStore,
    backend: &dyn ConversionBackend,
    timeout: Duration,
    input: &ModelInput,
    input_format: SourceFormat,
    op: BackendOp,
    output_format: TargetFormat,
) -> Result<StageOutput, PipelineError> {
    let started = Instant::now();
    let workspace = ScratchWorkspace::create(stage)?;
    let (input_path, input_bytes) = workspace
        .materialize(store, input, &format!("source.{input_format}"))
        .await?;
    let output = workspace.file(&format!("output.{}", output_format.extension()));

    let job = BackendJob {
        input: input_path,
        input_format,
        output: output.clone(),
        op,
    };
    debug!(stage, backend = backend.name(), op = job.op.name(), "running backend");
    workspace::with_timeout(stage, timeout, backend.run(&job)).await?;

    let bytes = workspace::read_output(stage, &output).await?;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        stage,
        backend = backend.name(),
        input_bytes,
        output_bytes = bytes.len(),
        elapsed_ms,
        "stage complete"
    );
    Ok(StageOutput {
        output_bytes: bytes.len() as u64,
        bytes,
        input_bytes,
        elapsed_ms,
        output_format,
    })
}
