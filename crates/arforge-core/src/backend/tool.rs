use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::info;

use crate::backend::process::{DEFAULT_MAX_OUTPUT_BYTES, ToolCommand, resolve_program, run_tool};
use crate::backend::{BackendJob, BackendOp, ConversionBackend};
use crate::error::PipelineError;
use crate::format::SourceFormat;

/// Imports the file named after `--`, applies the corrective transform to
/// root objects and exports glTF.
const BLENDER_EXPORT_SCRIPT: &str = r#"
import sys, math, bpy
from mathutils import Matrix
src, dst, fmt, scale, rot_x = sys.argv[sys.argv.index("--") + 1:][:5]
bpy.ops.wm.read_factory_settings(use_empty=True)
ext = src.rsplit(".", 1)[-1].lower()
importers = {
    "fbx": lambda p: bpy.ops.import_scene.fbx(filepath=p),
    "obj": lambda p: bpy.ops.wm.obj_import(filepath=p),
    "stl": lambda p: bpy.ops.wm.stl_import(filepath=p),
    "3ds": lambda p: bpy.ops.import_scene.max3ds(filepath=p),
    "glb": lambda p: bpy.ops.import_scene.gltf(filepath=p),
    "gltf": lambda p: bpy.ops.import_scene.gltf(filepath=p),
    "usdz": lambda p: bpy.ops.wm.usd_import(filepath=p),
}
importers[ext](src)
correction = Matrix.Rotation(math.radians(float(rot_x)), 4, "X") @ Matrix.Scale(float(scale), 4)
for obj in bpy.context.scene.objects:
    if obj.parent is None:
        obj.matrix_world = correction @ obj.matrix_world
bpy.ops.export_scene.gltf(filepath=dst, export_format=fmt, export_apply=True)
"#;

/// External tools the pipeline knows how to drive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ToolKind {
    /// Interchange import and glTF export.
    Blender,
    /// glTF to USDZ packaging (`usd_from_gltf`).
    UsdConverter,
    /// Mesh simplification.
    Gltfpack,
    /// Draco compression and simplification.
    GltfTransform,
}

impl ToolKind {
    pub fn default_program(self) -> &'static str {
        match self {
            ToolKind::Blender => "blender",
            ToolKind::UsdConverter => "usd_from_gltf",
            ToolKind::Gltfpack => "gltfpack",
            ToolKind::GltfTransform => "gltf-transform",
        }
    }
}

/// A [`ConversionBackend`] backed by a command-line tool.
#[derive(Debug, Clone)]
pub struct ToolBackend {
    kind: ToolKind,
    name: String,
    program: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ToolBackend {
    pub fn new(kind: ToolKind, program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            kind,
            name: kind.to_string(),
            program: program.into(),
            timeout,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }

    pub fn kind(&self) -> ToolKind {
        self.kind
    }

    fn unsupported(&self, op: &BackendOp) -> PipelineError {
        PipelineError::InvalidOptions(format!("{} cannot perform {}", self.kind, op.name()))
    }

    /// Build the invocation for a job without running it.
    pub fn command_for(&self, job: &BackendJob) -> Result<ToolCommand, PipelineError> {
        let cmd = ToolCommand::new(&self.program, self.timeout).max_output_bytes(self.max_output_bytes);
        let input = job.input.as_os_str();
        let output = job.output.as_os_str();

        match (self.kind, &job.op) {
            (ToolKind::Blender, BackendOp::ExportGltf { binary, transform }) => {
                if matches!(job.input_format, SourceFormat::Step | SourceFormat::Stp) {
                    return Err(PipelineError::UnsupportedFormat(format!(
                        "{} import requires a CAD kernel",
                        job.input_format
                    )));
                }
                let (scale, rotate_x) = transform.map_or((1.0, 0.0), |t| (t.scale, t.rotate_x));
                let export_format = if *binary { "GLB" } else { "GLTF_EMBEDDED" };
                Ok(cmd
                    .args(["--background", "--factory-startup", "--python-exit-code", "1"])
                    .args(["--python-expr", BLENDER_EXPORT_SCRIPT, "--"])
                    .arg(input)
                    .arg(output)
                    .arg(export_format)
                    .arg(scale.to_string())
                    .arg(rotate_x.to_string()))
            }
            (ToolKind::UsdConverter, BackendOp::ExportUsdz) => {
                if !job.input_format.is_gltf_family() {
                    return Err(PipelineError::UnsupportedFormat(format!(
                        "USDZ packaging needs glTF input, got {}",
                        job.input_format
                    )));
                }
                Ok(cmd.arg(input).arg(output))
            }
            (ToolKind::Gltfpack, BackendOp::Simplify { reduction }) => Ok(cmd
                .arg("-i")
                .arg(input)
                .arg("-o")
                .arg(output)
                .args(["-si".to_owned(), format!("{:.4}", 1.0 - reduction)])
                .arg("-noq")),
            (ToolKind::GltfTransform, BackendOp::Simplify { reduction }) => Ok(cmd
                .arg("simplify")
                .arg(input)
                .arg(output)
                .args(["--ratio".to_owned(), format!("{:.4}", 1.0 - reduction)])
                .args(["--error", "0.001"])),
            (ToolKind::GltfTransform, BackendOp::DracoEncode(options)) => {
                let speed = 10 - options.compression_level.min(10);
                Ok(cmd
                    .arg("draco")
                    .arg(input)
                    .arg(output)
                    .args(["--method", "edgebreaker"])
                    .args(["--encode-speed".to_owned(), speed.to_string()])
                    .args(["--decode-speed".to_owned(), speed.to_string()])
                    .args([
                        "--quantize-position".to_owned(),
                        options.position_bits.to_string(),
                    ])
                    .args(["--quantize-normal".to_owned(), options.normal_bits.to_string()])
                    .args([
                        "--quantize-texcoord".to_owned(),
                        options.texcoord_bits.to_string(),
                    ]))
            }
            (_, op) => Err(self.unsupported(op)),
        }
    }
}

#[async_trait]
impl ConversionBackend for ToolBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        resolve_program(&self.program).is_some()
    }

    async fn run(&self, job: &BackendJob) -> Result<(), PipelineError> {
        let cmd = self.command_for(job)?;
        let output = run_tool(&self.name, &cmd).await?;
        info!(
            tool = %self.kind,
            op = job.op.name(),
            elapsed_ms = output.elapsed.as_millis() as u64,
            "tool run complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::CorrectiveTransform;
    use crate::optimize::draco::DracoOptions;

    fn job(format: SourceFormat, op: BackendOp) -> BackendJob {
        BackendJob {
            input: PathBuf::from("/tmp/in.src"),
            input_format: format,
            output: PathBuf::from("/tmp/out.dst"),
            op,
        }
    }

    fn backend(kind: ToolKind) -> ToolBackend {
        ToolBackend::new(kind, kind.default_program(), Duration::from_secs(60))
    }

    #[test]
    fn blender_passes_paths_format_and_transform_after_separator() {
        let cmd = backend(ToolKind::Blender)
            .command_for(&job(
                SourceFormat::Fbx,
                BackendOp::ExportGltf {
                    binary: true,
                    transform: Some(CorrectiveTransform {
                        scale: 0.01,
                        rotate_x: -90.0,
                    }),
                },
            ))
            .unwrap();
        let args = cmd.args_lossy();
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(
            &args[sep + 1..],
            ["/tmp/in.src", "/tmp/out.dst", "GLB", "0.01", "-90"]
        );
        assert!(args.contains(&"--background".to_owned()));
        assert_eq!(cmd.timeout, Duration::from_secs(60));
    }

    #[test]
    fn blender_refuses_step_sources() {
        let err = backend(ToolKind::Blender)
            .command_for(&job(
                SourceFormat::Step,
                BackendOp::ExportGltf {
                    binary: true,
                    transform: None,
                },
            ))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn usd_converter_needs_gltf_input() {
        let usd = backend(ToolKind::UsdConverter);
        let cmd = usd
            .command_for(&job(SourceFormat::Glb, BackendOp::ExportUsdz))
            .unwrap();
        assert_eq!(cmd.args_lossy(), ["/tmp/in.src", "/tmp/out.dst"]);
        assert!(
            usd.command_for(&job(SourceFormat::Obj, BackendOp::ExportUsdz))
                .is_err()
        );
    }

    #[test]
    fn simplify_ratio_is_fraction_kept() {
        let cmd = backend(ToolKind::Gltfpack)
            .command_for(&job(SourceFormat::Glb, BackendOp::Simplify { reduction: 0.8 }))
            .unwrap();
        let args = cmd.args_lossy();
        let si = args.iter().position(|a| a == "-si").unwrap();
        assert_eq!(args[si + 1], "0.2000");
    }

    #[test]
    fn draco_maps_level_to_encoder_speed() {
        let options = DracoOptions {
            compression_level: 7,
            ..DracoOptions::default()
        };
        let cmd = backend(ToolKind::GltfTransform)
            .command_for(&job(SourceFormat::Glb, BackendOp::DracoEncode(options)))
            .unwrap();
        let args = cmd.args_lossy();
        assert_eq!(args[0], "draco");
        let speed = args.iter().position(|a| a == "--encode-speed").unwrap();
        assert_eq!(args[speed + 1], "3");
        let bits = args.iter().position(|a| a == "--quantize-position").unwrap();
        assert_eq!(args[bits + 1], "14");
    }

    #[test]
    fn mismatched_operation_is_rejected() {
        let err = backend(ToolKind::Gltfpack)
            .command_for(&job(SourceFormat::Glb, BackendOp::ExportUsdz))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOptions(_)));
    }

    #[test]
    fn kinds_parse_from_config_strings() {
        assert_eq!("gltf-transform".parse::<ToolKind>().ok(), Some(ToolKind::GltfTransform));
        assert_eq!(ToolKind::UsdConverter.to_string(), "usd-converter");
    }
}
