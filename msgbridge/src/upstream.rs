//! Client for the chat-completions provider that requests are forwarded to.

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use tracing::{debug, instrument};

use crate::config::UpstreamConfig;
use crate::errors::{Error, Result};
use crate::transcode::models::{TargetRequest, TargetResponse};

/// Raw response body chunks from a streaming call.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Sends transcoded requests to the provider.
///
/// Failures are reported as [`Error::Upstream`] (provider error or unreachable) or
/// [`Error::MalformedUpstream`] (a 2xx body that is not a chat completion).
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: &TargetRequest) -> Result<TargetResponse>;

    async fn send_streaming(&self, request: &TargetRequest) -> Result<ByteStream>;
}

pub struct HttpUpstream {
    client: Client,
    completions_url: String,
    api_key: Option<String>,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Internal {
                operation: format!("build upstream HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            completions_url: config.completions_url(),
            api_key: config.api_key.clone(),
        })
    }

    async fn post(&self, request: &TargetRequest) -> Result<reqwest::Response> {
        let mut builder = self.client.post(&self.completions_url).json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(unreachable_upstream)?;
        let status = response.status();
        debug!(status = %status, "Upstream responded");

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Upstream {
            status,
            message: provider_error_message(&body).unwrap_or_else(|| fallback_message(status, &body)),
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    #[instrument(skip_all, fields(model = %request.model))]
    async fn send(&self, request: &TargetRequest) -> Result<TargetResponse> {
        let body = self.post(request).await?.bytes().await.map_err(unreachable_upstream)?;

        serde_json::from_slice(&body).map_err(|e| Error::MalformedUpstream {
            message: format!("invalid chat completion body: {e}"),
        })
    }

    #[instrument(skip_all, fields(model = %request.model))]
    async fn send_streaming(&self, request: &TargetRequest) -> Result<ByteStream> {
        let response = self.post(request).await?;
        Ok(response.bytes_stream().map(|chunk| chunk.map_err(unreachable_upstream)).boxed())
    }
}

fn unreachable_upstream(e: reqwest::Error) -> Error {
    Error::Upstream {
        status: StatusCode::BAD_GATEWAY,
        message: format!("Upstream request failed: {e}"),
    }
}

/// Extract `error.message` from a provider error body.
fn provider_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.pointer("/error/message")?.as_str().map(str::to_string)
}

fn fallback_message(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.canonical_reason().unwrap_or("Upstream error").to_string()
    } else {
        body.to_string()
    }
}
