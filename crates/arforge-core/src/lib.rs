//! Validation, normalization, conversion and optimization of 3D assets for AR.

pub mod backend;
pub mod config;
pub mod error;
pub mod format;
pub mod model;
pub mod normalize;
pub mod optimize;
pub mod pipeline;
pub mod runtime;
pub mod stage;
pub mod storage;
pub mod validate;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use format::{FormatClass, SourceFormat, TargetFormat};
pub use model::{Asset, AssetId, BoundingBox, ConversionJob, JobId, JobStatus, ValidationStatus};
pub use pipeline::{Backends, ImportRequest, Pipeline};
pub use runtime::types::{ConversionOptions, ConversionStatus};
pub use storage::{ObjectStore, RecordStore, ValidationOutcome};
pub use validate::{ValidationLimits, ValidationReport};
