//! Command-line surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use arforge_core::normalize::{check_orientation, check_scale, suggest_transform};
use arforge_core::optimize::texture::thumbnail_async;
use arforge_core::optimize::{MaterialConsolidator, Platform, TextureCodec, TextureEncoder, TextureOptions};
use arforge_core::stage::workspace::external_resources;
use arforge_core::storage::fs::FsObjectStore;
use arforge_core::{
    BoundingBox, ConversionOptions, ImportRequest, JobStatus, Pipeline, PipelineConfig,
    TargetFormat,
};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::sqlite::SqliteRecordStore;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a local model file as a new asset
    Import {
        file: PathBuf,
        #[arg(long, default_value = "default")]
        project: String,
        /// MIME type; used when the extension is not recognised
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long, default_value_t = 0)]
        polys: u64,
        #[arg(long, default_value_t = 0)]
        materials: u32,
        #[arg(long, default_value_t = 0)]
        textures: u32,
        /// `minX,minY,minZ,maxX,maxY,maxZ` or `width,height,depth`
        #[arg(long, value_parser = parse_bbox)]
        bbox: Option<BoundingBox>,
    },
    /// Run the AR-readiness checks on an asset
    Validate { asset: String },
    /// Convert an asset and wait for every job to finish
    Convert {
        asset: String,
        /// Repeatable; defaults depend on the source format
        #[arg(long = "target", value_name = "FORMAT")]
        targets: Vec<TargetFormat>,
        /// Also build the LOD ladder
        #[arg(long)]
        lods: bool,
        /// Skip the zero-reduction repack of GLB output
        #[arg(long)]
        no_optimize: bool,
        /// Bake the suggested orientation and scale fix into the export
        #[arg(long)]
        apply_corrections: bool,
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },
    /// Show the conversion jobs of an asset
    Status { asset: String },
    /// Infer the source unit and compare against a product category
    CheckScale {
        #[arg(long, value_parser = parse_bbox, required_unless_present = "asset")]
        bbox: Option<BoundingBox>,
        #[arg(long)]
        asset: Option<String>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Detect the up axis of a model
    CheckOrientation {
        #[arg(long, required_unless_present = "asset")]
        format: Option<String>,
        #[arg(long, value_parser = parse_bbox)]
        bbox: Option<BoundingBox>,
        #[arg(long)]
        asset: Option<String>,
    },
    /// Resize to a power of two and re-encode a texture
    Texture {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        max_dimension: Option<u32>,
        #[arg(long)]
        codec: Option<TextureCodec>,
        #[arg(long)]
        quality: Option<u8>,
    },
    /// Write a square JPEG thumbnail
    Thumbnail {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = 256)]
        size: u32,
    },
    /// List material changes for a target platform
    Materials {
        platform: Platform,
        #[arg(long)]
        asset: Option<String>,
        #[arg(long, default_value_t = 1)]
        materials: u32,
        #[arg(long, default_value_t = 0)]
        textures: u32,
    },
    /// Report which conversion backends are usable
    Tools,
}

pub async fn run(command: Command, cfg: &Config) -> Result<()> {
    match command {
        Command::Import {
            file,
            project,
            content_type,
            polys,
            materials,
            textures,
            bbox,
        } => {
            let pipeline = open_pipeline(cfg).await?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let resources = gltf_resources(&file, &bytes).await?;
            let asset = pipeline
                .import(ImportRequest {
                    project_id: project,
                    file_name: file_name(&file)?,
                    content_type,
                    bytes: Bytes::from(bytes),
                    poly_count: polys,
                    material_count: materials,
                    texture_count: textures,
                    bounding_box: bbox,
                    resources,
                })
                .await?;
            print_json(&asset)
        }
        Command::Validate { asset } => {
            let pipeline = open_pipeline(cfg).await?;
            print_json(&pipeline.validate_asset(&asset).await?)
        }
        Command::Convert {
            asset,
            targets,
            lods,
            no_optimize,
            apply_corrections,
            poll_ms,
        } => {
            let pipeline = open_pipeline(cfg).await?;
            let options = ConversionOptions {
                optimize: !no_optimize,
                generate_lods: lods,
                apply_corrections,
            };
            convert(&pipeline, &asset, &targets, options, Duration::from_millis(poll_ms)).await
        }
        Command::Status { asset } => {
            let pipeline = open_pipeline(cfg).await?;
            print_json(&pipeline.get_conversion_status(&asset).await?)
        }
        Command::CheckScale {
            bbox,
            asset,
            category,
        } => {
            let bbox = match asset {
                Some(id) => open_pipeline(cfg)
                    .await?
                    .get_asset(&id)
                    .await?
                    .bounding_box
                    .with_context(|| format!("asset {id} has no bounding box"))?,
                None => bbox.context("--bbox is required")?,
            };
            print_json(&check_scale(&bbox, category.as_deref()))
        }
        Command::CheckOrientation {
            format,
            bbox,
            asset,
        } => {
            let (format, bbox) = match asset {
                Some(id) => {
                    let asset = open_pipeline(cfg).await?.get_asset(&id).await?;
                    (asset.original_format, asset.bounding_box)
                }
                None => (format.context("--format is required")?, bbox),
            };
            let mut report = serde_json::to_value(check_orientation(&format, bbox.as_ref()))?;
            if let Some(bbox) = &bbox {
                report["suggested_transform"] =
                    serde_json::to_value(suggest_transform(&format, bbox, None))?;
            }
            print_json(&report)
        }
        Command::Texture {
            input,
            output,
            max_dimension,
            codec,
            quality,
        } => {
            let defaults = load_pipeline_config(cfg)?.texture;
            let encoder = TextureEncoder::new(TextureOptions {
                max_dimension: max_dimension.unwrap_or(defaults.max_dimension),
                codec: codec.unwrap_or(defaults.codec),
                quality: quality.unwrap_or(defaults.quality),
            })?;
            let source = tokio::fs::read(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let result = encoder.reencode_async(Bytes::from(source)).await?;
            tokio::fs::write(&output, &result.output)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            print_json(&result)
        }
        Command::Thumbnail {
            input,
            output,
            size,
        } => {
            let source = tokio::fs::read(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let thumb = thumbnail_async(Bytes::from(source), size).await?;
            tokio::fs::write(&output, &thumb)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            info!(output = %output.display(), bytes = thumb.len(), size, "thumbnail written");
            Ok(())
        }
        Command::Materials {
            platform,
            asset,
            materials,
            textures,
        } => {
            let report = match asset {
                Some(id) => {
                    let asset = open_pipeline(cfg).await?.get_asset(&id).await?;
                    MaterialConsolidator.consolidate_asset(platform, &asset)
                }
                None => MaterialConsolidator.consolidate(platform, materials, textures),
            };
            print_json(&report)
        }
        Command::Tools => {
            let config = load_pipeline_config(cfg)?;
            print_json(&arforge_core::Backends::from_config(&config).availability())
        }
    }
}

async fn convert(
    pipeline: &Pipeline,
    asset_id: &str,
    targets: &[TargetFormat],
    options: ConversionOptions,
    poll: Duration,
) -> Result<()> {
    let orphaned = pipeline.fail_orphaned_jobs(asset_id).await?;
    if orphaned > 0 {
        warn!(asset_id, orphaned, "jobs from an earlier run were marked failed");
    }

    let workers = pipeline.start_workers();
    let jobs = pipeline
        .request_conversion(asset_id, targets, options)
        .await?;
    info!(asset_id, jobs = jobs.len(), "waiting for conversion jobs");

    let status = tokio::select! {
        status = pipeline.wait_until_settled(asset_id, &jobs, poll) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!(asset_id, "interrupted; queued work is abandoned");
            pipeline.requested_status(asset_id, &jobs).await?
        }
    };
    workers.shutdown();

    print_json(&status)?;
    let failed = status
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::Failed)
        .count();
    if failed > 0 {
        bail!("{failed} of {} conversion jobs failed", status.jobs.len());
    }
    Ok(())
}

fn load_pipeline_config(cfg: &Config) -> Result<PipelineConfig> {
    match &cfg.pipeline_config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading pipeline config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

async fn open_pipeline(cfg: &Config) -> Result<Pipeline> {
    let config = load_pipeline_config(cfg)?;
    let records = SqliteRecordStore::connect(&cfg.database_url)
        .await
        .with_context(|| format!("opening database {}", cfg.database_url))?;
    info!(database_url = %cfg.database_url, "database ready");
    let objects = FsObjectStore::new(&cfg.storage_dir);
    Ok(Pipeline::from_config(
        config,
        Arc::new(records),
        Arc::new(objects),
    ))
}

/// Files next to a `.gltf` that it references; nothing for other formats.
async fn gltf_resources(file: &Path, bytes: &[u8]) -> Result<Vec<(String, Bytes)>> {
    let is_gltf = file
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gltf"));
    if !is_gltf {
        return Ok(Vec::new());
    }
    let dir = file.parent().unwrap_or(Path::new("."));
    let mut resources = Vec::new();
    for relative in external_resources(bytes)? {
        let path = dir.join(&relative);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {} referenced by {}", path.display(), file.display()))?;
        resources.push((relative, Bytes::from(data)));
    }
    Ok(resources)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Six values are min/max corners; three are extents from the origin.
fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid number in '{s}': {e}"))?;
    match values.as_slice() {
        [w, h, d] => Ok(BoundingBox::new([0.0; 3], [*w, *h, *d])),
        [x0, y0, z0, x1, y1, z1] => Ok(BoundingBox::new([*x0, *y0, *z0], [*x1, *y1, *z1])),
        _ => Err(format!("expected 3 or 6 comma-separated values, got {}", values.len())),
    }
}

#[cfg(test)]
mod tests {
    use arforge_core::ConversionJob;
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bounding_boxes_parse_from_extents_or_corners() {
        let extents = parse_bbox("2, 1, 0.5").unwrap();
        assert_eq!(extents.min, [0.0; 3]);
        assert_eq!(extents.max, [2.0, 1.0, 0.5]);

        let corners = parse_bbox("-1,-1,-1,1,1,1").unwrap();
        assert_eq!(corners.dimensions().width, 2.0);

        assert!(parse_bbox("1,2").is_err());
        assert!(parse_bbox("a,b,c").is_err());
    }

    #[test]
    fn convert_flags_parse() {
        let cli = Cli::try_parse_from([
            "arforge", "convert", "abc", "--target", "glb", "--target", "USDZ", "--lods",
            "--no-optimize",
        ])
        .unwrap();
        match cli.command {
            Command::Convert {
                asset,
                targets,
                lods,
                no_optimize,
                apply_corrections,
                ..
            } => {
                assert_eq!(asset, "abc");
                assert_eq!(targets, vec![TargetFormat::Glb, TargetFormat::Usdz]);
                assert!(lods && no_optimize && !apply_corrections);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn import_then_status_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("Lamp.obj");
        tokio::fs::write(&model, b"v 0 0 0\n").await.unwrap();
        let cfg = Config {
            database_url: "sqlite::memory:".to_owned(),
            storage_dir: dir.path().join("objects"),
            pipeline_config: None,
            log_level: "info".to_owned(),
            log_json: false,
            log_dir: None,
        };

        let pipeline = open_pipeline(&cfg).await.unwrap();
        let asset = pipeline
            .import(ImportRequest {
                project_id: "p".to_owned(),
                file_name: file_name(&model).unwrap(),
                content_type: None,
                bytes: Bytes::from_static(b"v 0 0 0\n"),
                poly_count: 10,
                material_count: 1,
                texture_count: 0,
                bounding_box: None,
                resources: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(asset.original_format, "obj");
        assert!(asset.original_uri.starts_with("file://"));

        let report = pipeline.validate_asset(&asset.id).await.unwrap();
        assert!(report.is_valid);
        let status = pipeline.get_conversion_status(&asset.id).await.unwrap();
        assert!(status.jobs.is_empty());
        assert_eq!(status.overall_progress_percent, 0);
    }

    #[tokio::test]
    async fn convert_returns_despite_an_unfinished_earlier_job() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            database_url: "sqlite::memory:".to_owned(),
            storage_dir: dir.path().join("objects"),
            pipeline_config: None,
            log_level: "info".to_owned(),
            log_json: false,
            log_dir: None,
        };
        let pipeline = open_pipeline(&cfg).await.unwrap();
        let asset = pipeline
            .import(ImportRequest {
                project_id: "p".to_owned(),
                file_name: "shoe.glb".to_owned(),
                content_type: None,
                bytes: Bytes::from_static(b"glTF-binary"),
                poly_count: 10,
                material_count: 1,
                texture_count: 0,
                bounding_box: None,
                resources: Vec::new(),
            })
            .await
            .unwrap();
        // Left behind by a run that was interrupted.
        let stale = ConversionJob::new(&asset.id, "glb", TargetFormat::Usdz);
        pipeline.records().insert_job(stale.clone()).await.unwrap();

        let options = ConversionOptions {
            optimize: false,
            ..ConversionOptions::default()
        };
        tokio::time::timeout(
            Duration::from_secs(10),
            convert(&pipeline, &asset.id, &[TargetFormat::Glb], options, Duration::from_millis(5)),
        )
        .await
        .expect("convert did not return")
        .unwrap();

        let stale = pipeline.records().get_job(&stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, JobStatus::Failed);
        let asset = pipeline.get_asset(&asset.id).await.unwrap();
        assert!(asset.format_urls.contains_key(&TargetFormat::Glb));
    }

    #[tokio::test]
    async fn gltf_import_stores_referenced_files_beside_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("scene.gltf");
        let gltf = br#"{"buffers": [{"uri": "scene.bin", "byteLength": 4}]}"#;
        tokio::fs::write(&model, gltf).await.unwrap();
        tokio::fs::write(dir.path().join("scene.bin"), b"bins").await.unwrap();
        let cfg = Config {
            database_url: "sqlite::memory:".to_owned(),
            storage_dir: dir.path().join("objects"),
            pipeline_config: None,
            log_level: "info".to_owned(),
            log_json: false,
            log_dir: None,
        };

        let resources = gltf_resources(&model, gltf).await.unwrap();
        assert_eq!(resources.len(), 1);
        let pipeline = open_pipeline(&cfg).await.unwrap();
        let asset = pipeline
            .import(ImportRequest {
                project_id: "p".to_owned(),
                file_name: file_name(&model).unwrap(),
                content_type: None,
                bytes: Bytes::from_static(gltf),
                poly_count: 0,
                material_count: 0,
                texture_count: 0,
                bounding_box: None,
                resources,
            })
            .await
            .unwrap();

        let stored = Path::new(asset.original_uri.trim_start_matches("file://"));
        let sibling = stored.parent().unwrap().join("scene.bin");
        assert_eq!(tokio::fs::read(sibling).await.unwrap(), b"bins");

        tokio::fs::remove_file(dir.path().join("scene.bin")).await.unwrap();
        assert!(gltf_resources(&model, gltf).await.is_err());
    }
}
