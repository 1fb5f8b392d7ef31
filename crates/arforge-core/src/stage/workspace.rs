use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tracing::debug;

use crate::error::PipelineError;
use crate::storage::{ObjectStore, check_key};

/// Where a stage reads its input model from.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput {
    /// A URI understood by the configured [`ObjectStore`].
    Uri(String),
    /// Bytes handed over from a previous stage.
    Bytes(Bytes),
}

impl ModelInput {
    pub fn describe(&self) -> String {
        match self {
            ModelInput::Uri(uri) => uri.clone(),
            ModelInput::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

/// Private scratch directory for one stage invocation.
///
/// Removed when dropped, on success and failure alike.
#[derive(Debug)]
pub struct ScratchWorkspace {
    dir: TempDir,
}

impl ScratchWorkspace {
    pub fn create(stage: &str) -> Result<Self, PipelineError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("arforge-{stage}-"))
            .tempdir()?;
        debug!(stage, path = %dir.path().display(), "scratch workspace created");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write the input model into the workspace and return its path and size.
    pub async fn materialize(
        &self,
        store: &dyn ObjectStore,
        input: &ModelInput,
        file_name: &str,
    ) -> Result<(PathBuf, u64), PipelineError> {
        let bytes = resolve_input(store, input).await?;
        let path = self.file(file_name);
        tokio::fs::write(&path, &bytes).await?;
        if let ModelInput::Uri(uri) = input
            && file_name.ends_with(".gltf")
        {
            self.fetch_resources(store, uri, &bytes).await?;
        }
        Ok((path, bytes.len() as u64))
    }

    /// Copy the buffers and images a `.gltf` references next to it.
    async fn fetch_resources(
        &self,
        store: &dyn ObjectStore,
        gltf_uri: &str,
        gltf: &[u8],
    ) -> Result<(), PipelineError> {
        for relative in external_resources(gltf)? {
            let uri = sibling_uri(gltf_uri, &relative);
            let bytes = store.download(&uri).await.map_err(|e| PipelineError::DownloadFailed {
                uri: uri.clone(),
                message: e.to_string(),
            })?;
            let path = self.file(&relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &bytes).await?;
            debug!(resource = %relative, size = bytes.len(), "gltf resource fetched");
        }
        Ok(())
    }
}

/// Relative `uri`s of a glTF document's buffers and images.
///
/// Embedded `data:` URIs and absolute URLs are skipped. Paths that would
/// leave the model's directory are rejected.
pub fn external_resources(gltf: &[u8]) -> Result<Vec<String>, PipelineError> {
    let document: serde_json::Value = serde_json::from_slice(gltf)
        .map_err(|e| PipelineError::UnsupportedFormat(format!("gltf is not valid JSON: {e}")))?;
    let mut resources: Vec<String> = Vec::new();
    for section in ["buffers", "images"] {
        let Some(entries) = document.get(section).and_then(|v| v.as_array()) else {
            continue;
        };
        for uri in entries.iter().filter_map(|e| e.get("uri")?.as_str()) {
            if uri.starts_with("data:") || uri.contains("://") {
                continue;
            }
            check_key(uri).map_err(|_| {
                PipelineError::UnsupportedFormat(format!(
                    "gltf resource '{uri}' is outside the model directory"
                ))
            })?;
            if !resources.iter().any(|r| r == uri) {
                resources.push(uri.to_owned());
            }
        }
    }
    Ok(resources)
}

/// `relative` resolved against the directory of `base`.
fn sibling_uri(base: &str, relative: &str) -> String {
    match base.rfind('/') {
        Some(slash) => format!("{}{relative}", &base[..=slash]),
        None => relative.to_owned(),
    }
}

/// Fetch the bytes behind a [`ModelInput`]. Empty sources are rejected.
pub async fn resolve_input(
    store: &dyn ObjectStore,
    input: &ModelInput,
) -> Result<Bytes, PipelineError> {
    let bytes = match input {
        ModelInput::Bytes(bytes) => bytes.clone(),
        ModelInput::Uri(uri) => store.download(uri).await.map_err(|e| match e {
            PipelineError::DownloadFailed { .. } => e,
            other => PipelineError::DownloadFailed {
                uri: uri.clone(),
                message: other.to_string(),
            },
        })?,
    };
    if bytes.is_empty() {
        return Err(PipelineError::DownloadFailed {
            uri: input.describe(),
            message: "empty body".to_owned(),
        });
    }
    Ok(bytes)
}

/// Read a backend's output, failing if it is missing or empty.
pub async fn read_output(stage: &str, path: &Path) -> Result<Bytes, PipelineError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {
            Ok(Bytes::from(tokio::fs::read(path).await?))
        }
        _ => Err(PipelineError::NoOutputProduced {
            stage: stage.to_owned(),
        }),
    }
}

/// Bound `fut` by `timeout`, mapping expiry to `ConversionTimeout`.
pub async fn with_timeout<T, F>(stage: &str, timeout: Duration, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| {
            Err(PipelineError::ConversionTimeout {
                stage: stage.to_owned(),
                timeout,
            })
        })
}
