//! Test utilities for integration testing (available with `test-utils` feature).

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::admission::Clock;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::transcode::models::{TargetRequest, TargetResponse};
use crate::upstream::{ByteStream, Upstream};

/// Clock that only moves when told to. Starts at 2024-01-01T00:00:00Z.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            millis: AtomicI64::new(1_704_067_200_000),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + TimeDelta::milliseconds(self.millis.load(Ordering::SeqCst))
    }
}

pub fn create_test_config() -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    };
    config.upstream.url = "http://localhost:8081/v1".parse().expect("static URL is valid");
    config.admission.allowed_keys = vec!["test-key".to_string()];
    config
}

/// Canned behaviour for [`FakeUpstream`].
#[derive(Debug, Clone)]
pub enum FakeReply {
    /// Body returned by `send`
    Json(TargetResponse),
    /// Chunks yielded by `send_streaming`, in order
    Chunks(Vec<Bytes>),
    /// Chunks followed by a read error
    ChunksThenError(Vec<Bytes>),
    /// Provider error with this status and message
    Status(StatusCode, String),
}

/// In-process [`Upstream`] that records requests and replays a fixed reply.
#[derive(Debug)]
pub struct FakeUpstream {
    reply: FakeReply,
    requests: Mutex<Vec<TargetRequest>>,
}

impl FakeUpstream {
    pub fn new(reply: FakeReply) -> Self {
        Self {
            reply,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn streaming(chunks: &[&str]) -> Self {
        Self::new(FakeReply::Chunks(
            chunks.iter().map(|chunk| Bytes::copy_from_slice(chunk.as_bytes())).collect(),
        ))
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<TargetRequest> {
        self.requests.lock().expect("fake upstream lock poisoned").clone()
    }

    fn record(&self, request: &TargetRequest) {
        self.requests.lock().expect("fake upstream lock poisoned").push(request.clone());
    }

    fn status_error(status: StatusCode, message: &str) -> Error {
        Error::Upstream {
            status,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn send(&self, request: &TargetRequest) -> Result<TargetResponse> {
        self.record(request);
        match &self.reply {
            FakeReply::Json(response) => Ok(response.clone()),
            FakeReply::Status(status, message) => Err(Self::status_error(*status, message)),
            FakeReply::Chunks(_) | FakeReply::ChunksThenError(_) => Err(Error::MalformedUpstream {
                message: "fake upstream only has a streaming reply".to_string(),
            }),
        }
    }

    async fn send_streaming(&self, request: &TargetRequest) -> Result<ByteStream> {
        self.record(request);
        match &self.reply {
            FakeReply::Chunks(chunks) => Ok(futures::stream::iter(chunks.clone().into_iter().map(Ok)).boxed()),
            FakeReply::ChunksThenError(chunks) => {
                let items = chunks
                    .clone()
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(Self::status_error(StatusCode::BAD_GATEWAY, "connection reset"))));
                Ok(futures::stream::iter(items).boxed())
            }
            FakeReply::Status(status, message) => Err(Self::status_error(*status, message)),
            FakeReply::Json(_) => Err(Error::MalformedUpstream {
                message: "fake upstream only has a JSON reply".to_string(),
            }),
        }
    }
}
