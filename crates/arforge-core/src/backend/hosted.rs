//! Hosted USDZ conversion used when no local converter is installed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use crate::backend::{BackendJob, BackendOp, ConversionBackend};
use crate::error::PipelineError;
use crate::format::TargetFormat;

const BACKEND_NAME: &str = "hosted";

/// State of a remote conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    Running,
    Succeeded { result_url: String },
    Failed { message: String },
}

/// Client side of a submit / poll / fetch conversion service.
#[async_trait]
pub trait HostedConversionApi: Send + Sync {
    /// Submit a model and return the remote job id.
    async fn submit(
        &self,
        input: Bytes,
        file_name: &str,
        target: TargetFormat,
    ) -> Result<String, PipelineError>;

    async fn status(&self, remote_id: &str) -> Result<RemoteStatus, PipelineError>;

    async fn fetch(&self, url: &str) -> Result<Bytes, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    result_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// `reqwest` client for the hosted service.
///
/// `POST {endpoint}/v1/conversions?target=..&filename=..` with the raw model
/// as body, then `GET {endpoint}/v1/conversions/{id}` until the status is
/// `completed` or `failed`.
#[derive(Debug, Clone)]
pub struct HttpConversionApi {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpConversionApi {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            api_key,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn checked(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PipelineError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| PipelineError::backend(BACKEND_NAME, e.to_string()))?;
        match response.status() {
            StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
                let body = response.text().await.unwrap_or_default();
                Err(PipelineError::QuotaExceeded(body))
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(PipelineError::backend(
                    BACKEND_NAME,
                    format!("HTTP {status}: {body}"),
                ))
            }
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl HostedConversionApi for HttpConversionApi {
    async fn submit(
        &self,
        input: Bytes,
        file_name: &str,
        target: TargetFormat,
    ) -> Result<String, PipelineError> {
        let target = target.to_string();
        let url = reqwest::Url::parse_with_params(
            &format!("{}/v1/conversions", self.endpoint),
            [("target", target.as_str()), ("filename", file_name)],
        )
        .map_err(|e| PipelineError::InvalidOptions(format!("hosted endpoint: {e}")))?;
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(input);
        let response: SubmitResponse = self
            .checked(request)
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::backend(BACKEND_NAME, e.to_string()))?;
        Ok(response.id)
    }

    async fn status(&self, remote_id: &str) -> Result<RemoteStatus, PipelineError> {
        let request = self
            .client
            .get(format!("{}/v1/conversions/{remote_id}", self.endpoint));
        let response: StatusResponse = self
            .checked(request)
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::backend(BACKEND_NAME, e.to_string()))?;
        Ok(match response.status.as_str() {
            "completed" | "succeeded" => match response.result_url {
                Some(result_url) => RemoteStatus::Succeeded { result_url },
                None => RemoteStatus::Failed {
                    message: "completed without a result url".to_owned(),
                },
            },
            "failed" | "error" => RemoteStatus::Failed {
                message: response.error.unwrap_or_else(|| "remote failure".to_owned()),
            },
            "processing" | "running" => RemoteStatus::Running,
            _ => RemoteStatus::Queued,
        })
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, PipelineError> {
        self.checked(self.client.get(url))
            .await?
            .bytes()
            .await
            .map_err(|e| PipelineError::DownloadFailed {
                uri: url.to_owned(),
                message: e.to_string(),
            })
    }
}

/// Poll until the remote job finishes, at most `max_polls` times.
///
/// Each poll waits `interval` first. Dropping the future abandons the loop.
pub async fn poll_until_done(
    api: &dyn HostedConversionApi,
    remote_id: &str,
    interval: Duration,
    max_polls: u32,
) -> Result<String, PipelineError> {
    for poll in 1..=max_polls {
        tokio::time::sleep(interval).await;
        match api.status(remote_id).await? {
            RemoteStatus::Succeeded { result_url } => return Ok(result_url),
            RemoteStatus::Failed { message } => {
                return Err(PipelineError::backend(BACKEND_NAME, message));
            }
            state => debug!(remote_id, poll, ?state, "hosted conversion pending"),
        }
    }
    Err(PipelineError::ConversionTimeout {
        stage: format!("{BACKEND_NAME}:{remote_id}"),
        timeout: interval * max_polls,
    })
}

/// [`ConversionBackend`] that performs USDZ packaging remotely.
#[derive(Clone)]
pub struct HostedBackend {
    api: Arc<dyn HostedConversionApi>,
    poll_interval: Duration,
    max_polls: u32,
}

impl HostedBackend {
    pub fn new(api: Arc<dyn HostedConversionApi>, poll_interval: Duration, max_polls: u32) -> Self {
        Self {
            api,
            poll_interval,
            max_polls,
        }
    }

    /// Upper bound on time spent polling.
    pub fn poll_budget(&self) -> Duration {
        self.poll_interval * self.max_polls
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_owned())
}

#[async_trait]
impl ConversionBackend for HostedBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn run(&self, job: &BackendJob) -> Result<(), PipelineError> {
        if job.op != BackendOp::ExportUsdz {
            return Err(PipelineError::InvalidOptions(format!(
                "hosted backend cannot perform {}",
                job.op.name()
            )));
        }
        let input = Bytes::from(tokio::fs::read(&job.input).await?);
        let remote_id = self
            .api
            .submit(input, &file_name(&job.input), TargetFormat::Usdz)
            .await?;
        info!(remote_id = %remote_id, "hosted conversion submitted");

        let result_url =
            poll_until_done(self.api.as_ref(), &remote_id, self.poll_interval, self.max_polls)
                .await?;
        let output = self.api.fetch(&result_url).await?;
        tokio::fs::write(&job.output, &output).await?;
        info!(remote_id = %remote_id, size = output.len(), "hosted conversion fetched");
        Ok(())
    }
}
