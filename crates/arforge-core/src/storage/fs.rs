use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::PipelineError;
use crate::storage::{ObjectStore, check_key};

const FILE_SCHEME: &str = "file://";

/// Object store rooted at a local directory.
///
/// Uploads return `file://` URIs. Downloads additionally accept plain paths
/// and `http(s)://` URLs so that sources can live on a CDN.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    client: reqwest::Client,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn fetch_http(&self, url: &str) -> Result<Bytes, PipelineError> {
        let failed = |message: String| PipelineError::DownloadFailed {
            uri: url.to_owned(),
            message,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?
            .error_for_status()
            .map_err(|e| failed(e.to_string()))?;
        response.bytes().await.map_err(|e| failed(e.to_string()))
    }
}

fn local_path(uri: &str) -> &Path {
    Path::new(uri.strip_prefix(FILE_SCHEME).unwrap_or(uri))
}

fn is_http(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(
        &self,
        bytes: Bytes,
        key: &str,
        content_type: &str,
    ) -> Result<String, PipelineError> {
        check_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Storage(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| PipelineError::Storage(format!("{}: {e}", path.display())))?;
        let absolute = tokio::fs::canonicalize(&path).await?;
        debug!(key, content_type, size = bytes.len(), "object stored");
        Ok(format!("{FILE_SCHEME}{}", absolute.display()))
    }

    async fn download(&self, uri: &str) -> Result<Bytes, PipelineError> {
        if is_http(uri) {
            return self.fetch_http(uri).await;
        }
        tokio::fs::read(local_path(uri))
            .await
            .map(Bytes::from)
            .map_err(|e| PipelineError::DownloadFailed {
                uri: uri.to_owned(),
                message: e.to_string(),
            })
    }

    async fn head_size(&self, uri: &str) -> Result<Option<u64>, PipelineError> {
        if is_http(uri) {
            let response = self
                .client
                .head(uri)
                .send()
                .await
                .map_err(|e| PipelineError::Storage(e.to_string()))?;
            if !response.status().is_success() {
                return Ok(None);
            }
            return Ok(response.content_length());
        }
        match tokio::fs::metadata(local_path(uri)).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_returns_file_uri_that_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let uri = store
            .upload(Bytes::from_static(b"usdz!"), "assets/a1/usdz/j1.usdz", "model/vnd.usdz+zip")
            .await
            .unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("assets/a1/usdz/j1.usdz"));
        assert_eq!(store.download(&uri).await.unwrap(), Bytes::from_static(b"usdz!"));
        assert_eq!(store.head_size(&uri).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn missing_file_is_download_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let missing = dir.path().join("nope.glb");
        let uri = format!("file://{}", missing.display());
        assert!(matches!(
            store.download(&uri).await,
            Err(PipelineError::DownloadFailed { .. })
        ));
        assert_eq!(store.head_size(&uri).await.unwrap(), None);
    }

    #[tokio::test]
    async fn escaping_keys_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store
            .upload(Bytes::from_static(b"x"), "../outside.glb", "model/gltf-binary")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
    }
}
