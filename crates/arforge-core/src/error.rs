use std::time::Duration;

use thiserror::Error;

/// Errors produced by the pipeline.
///
/// Variants carry owned strings so that an error can be cloned into job
/// records and queue history without holding on to the underlying source.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The referenced asset or job does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The source format is outside the accepted set, or a stage was handed
    /// a format it cannot consume.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Fetching a source model failed.
    #[error("download failed for {uri}: {message}")]
    DownloadFailed { uri: String, message: String },

    /// A backend exited cleanly but left no (or an empty) output file.
    #[error("stage '{stage}' produced no output")]
    NoOutputProduced { stage: String },

    /// An external tool or hosted service reported a failure.
    #[error("conversion backend '{backend}' failed: {message}")]
    ConversionBackendError { backend: String, message: String },

    /// A stage or queued item exceeded its deadline.
    #[error("'{stage}' timed out after {}s", .timeout.as_secs())]
    ConversionTimeout { stage: String, timeout: Duration },

    /// The hosted conversion service rejected the request for quota reasons.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Caller-supplied options are out of range.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Record or object store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The work queue is at capacity.
    #[error("queue full: {queue} (capacity {capacity})")]
    QueueFull { queue: String, capacity: usize },

    /// The work queue has been shut down.
    #[error("queue closed: {0}")]
    QueueClosed(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// Texture decode or encode failure.
    #[error("image error: {0}")]
    Image(String),
}

impl PipelineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::ConversionBackendError {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Whether a queued item failing with this error should be attempted again.
    ///
    /// Missing records, unsupported formats, exhausted quota, bad options
    /// and undecodable images fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::DownloadFailed { .. }
                | PipelineError::NoOutputProduced { .. }
                | PipelineError::ConversionBackendError { .. }
                | PipelineError::ConversionTimeout { .. }
                | PipelineError::Storage(_)
                | PipelineError::QueueFull { .. }
                | PipelineError::Io(_)
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(e: image::ImageError) -> Self {
        PipelineError::Image(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Storage(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert!(PipelineError::backend("blender", "exit 1").is_retryable());
        assert!(
            PipelineError::ConversionTimeout {
                stage: "gltf".into(),
                timeout: Duration::from_secs(600),
            }
            .is_retryable()
        );
        assert!(
            PipelineError::NoOutputProduced {
                stage: "usdz".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn permanent_failures_are_not_retryable() {
        assert!(!PipelineError::not_found("asset", "a1").is_retryable());
        assert!(!PipelineError::UnsupportedFormat("dwg".into()).is_retryable());
        assert!(!PipelineError::InvalidOptions("level 11".into()).is_retryable());
        assert!(!PipelineError::QuotaExceeded("402".into()).is_retryable());
    }

    #[test]
    fn timeout_message_reports_seconds() {
        let err = PipelineError::ConversionTimeout {
            stage: "usdz".into(),
            timeout: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "'usdz' timed out after 300s");
    }
}
