//! `POST /v1/messages`: admission, transcoding and forwarding of one client request.

use std::convert::Infallible;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::AppState;
use crate::admission::RateStatus;
use crate::errors::{Error, Result};
use crate::transcode::models::{SourceRequest, SourceStreamEvent};
use crate::transcode::{StreamFrame, StreamTranscoder, encode_frames, to_source, to_target};
use crate::upstream::ByteStream;

pub const RATE_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_RESET_HEADER: &str = "x-ratelimit-reset";

/// Raw API key from `x-api-key`, or from `Authorization: Bearer <key>` when that is absent.
pub fn raw_key_from_headers(headers: &HeaderMap) -> Option<String> {
    let from_api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty());

    let from_bearer = || {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|key| !key.is_empty())
    };

    from_api_key.or_else(from_bearer).map(str::to_string)
}

fn apply_rate_headers(headers: &mut HeaderMap, status: &RateStatus) {
    headers.insert(RATE_LIMIT_HEADER, HeaderValue::from(status.limit));
    headers.insert(RATE_REMAINING_HEADER, HeaderValue::from(status.remaining));
    headers.insert(RATE_RESET_HEADER, HeaderValue::from(status.reset_epoch_secs()));
}

#[tracing::instrument(skip_all)]
pub async fn create_message(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(raw_key) = raw_key_from_headers(&headers) else {
        return Error::Unauthenticated {
            message: Some("Missing API key".to_string()),
        }
        .into_response();
    };

    if !state.admission.validate(&raw_key) {
        return Error::Unauthenticated {
            message: Some("Invalid API key".to_string()),
        }
        .into_response();
    }

    // Metered exactly once; the same status feeds both the decision and the headers.
    let rate = state.admission.check_rate(&raw_key);
    let mut response = if rate.allowed {
        forward(&state, &body).await.unwrap_or_else(IntoResponse::into_response)
    } else {
        Error::RateLimited {
            limit: rate.limit,
            reset_at: rate.reset_at,
        }
        .into_response()
    };

    apply_rate_headers(response.headers_mut(), &rate);
    response
}

async fn forward(state: &AppState, body: &Bytes) -> Result<Response> {
    let request: SourceRequest = serde_json::from_slice(body).map_err(|e| Error::BadRequest {
        message: format!("Invalid request body: {e}"),
    })?;
    let target = to_target(&request);
    debug!(model = %request.model, stream = target.stream, messages = target.messages.len(), "Forwarding request upstream");

    if target.stream {
        let upstream = state.upstream.send_streaming(&target).await?;
        Ok(event_stream_response(upstream))
    } else {
        let response = state.upstream.send(&target).await?;
        Ok(Json(to_source(response, &request.model)?).into_response())
    }
}

fn event_stream_response(upstream: ByteStream) -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        Body::from_stream(transcoded_events(upstream)),
    )
        .into_response()
}

struct EventStreamState {
    upstream: ByteStream,
    transcoder: StreamTranscoder,
    done: bool,
}

/// Feed upstream chunks through a [`StreamTranscoder`] as they arrive.
///
/// Ends once `[DONE]` is seen. When the upstream closes without it, one `message_stop` is
/// appended. A read error ends the body without one.
fn transcoded_events(upstream: ByteStream) -> impl futures::Stream<Item = std::result::Result<Bytes, Infallible>> + Send {
    let state = EventStreamState {
        upstream,
        transcoder: StreamTranscoder::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        while !state.done {
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.transcoder.feed(&chunk);
                    state.done = state.transcoder.is_finished();
                    if !frames.is_empty() {
                        return Some((Ok(encode_frames(&frames)), state));
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Upstream stream failed, ending response");
                    return None;
                }
                None => {
                    state.done = true;
                    let mut frames = state.transcoder.finish();
                    if !state.transcoder.is_finished() {
                        debug!("Upstream closed without [DONE], synthesizing message_stop");
                        frames.push(StreamFrame::Event(SourceStreamEvent::MessageStop));
                    }
                    return Some((Ok(encode_frames(&frames)), state));
                }
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use crate::test_utils::{FakeReply, FakeUpstream, ManualClock, create_test_config};
    use crate::transcode::models::{TargetChoice, TargetResponse, TargetResponseMessage, TargetRole, TargetUsage};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use std::sync::Arc;

    const DEV_PREFIXED_KEY: &str = "sk-ant-REDACTED";

    fn server_with(upstream: FakeUpstream, rate_limit: u32) -> (TestServer, Arc<FakeUpstream>) {
        let mut config = create_test_config();
        config.admission.rate_limit = rate_limit;
        let upstream = Arc::new(upstream);
        let state = AppState::builder()
            .admission(Arc::new(Admission::new(&config.admission, Arc::new(ManualClock::default()))))
            .upstream(upstream.clone())
            .config(config)
            .build();

        let server = TestServer::new(crate::build_router(state)).expect("Failed to create test server");
        (server, upstream)
    }

    fn completion(content: &str) -> FakeUpstream {
        FakeUpstream::new(FakeReply::Json(TargetResponse {
            id: "chatcmpl-42".into(),
            model: "gpt-4o-2024-08-06".into(),
            choices: vec![TargetChoice {
                message: TargetResponseMessage {
                    role: Some("assistant".into()),
                    content: Some(content.into()),
                },
                finish_reason: Some("stop".into()),
            }],
            usage: Some(TargetUsage {
                prompt_tokens: 9,
                completion_tokens: 2,
            }),
        }))
    }

    fn hello_request(stream: bool) -> Value {
        json!({
            "model": "claude-3-5-sonnet",
            "system": "Be terse",
            "max_tokens": 32,
            "stream": stream,
            "messages": [{"role": "user", "content": "Hi"}]
        })
    }

    #[test]
    fn api_key_header_takes_precedence_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(raw_key_from_headers(&headers).as_deref(), Some("from-bearer"));

        headers.insert("x-api-key", HeaderValue::from_static("from-header"));
        assert_eq!(raw_key_from_headers(&headers).as_deref(), Some("from-header"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        headers.insert("x-api-key", HeaderValue::from_static("  "));
        assert_eq!(raw_key_from_headers(&headers), None);
    }

    #[test_log::test(tokio::test)]
    async fn non_streaming_request_is_transcoded_both_ways() {
        let (server, upstream) = server_with(completion("Hello!"), 100);

        let response = server
            .post("/v1/messages")
            .add_header("x-api-key", "test-key")
            .json(&hello_request(false))
            .await;

        response.assert_status(StatusCode::OK);
        assert_eq!(
            response.json::<Value>(),
            json!({
                "id": "chatcmpl-42",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "Hello!"}],
                "model": "claude-3-5-sonnet",
                "stop_reason": "end_turn",
                "stop_sequence": null,
                "usage": {"input_tokens": 9, "output_tokens": 2}
            })
        );
        assert_eq!(response.header(RATE_LIMIT_HEADER), "100");
        assert_eq!(response.header(RATE_REMAINING_HEADER), "99");

        let sent = upstream.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].model, "claude-3-5-sonnet");
        assert_eq!(sent[0].messages[0].role, TargetRole::System);
        assert_eq!(sent[0].messages[1].content, "Hi");
        assert_eq!(sent[0].max_tokens, Some(32));
        assert!(!sent[0].stream);
    }

    #[tokio::test]
    async fn bearer_token_with_provider_prefix_is_accepted() {
        let (server, _upstream) = server_with(completion("ok"), 100);

        let response = server
            .post("/v1/messages")
            .add_header("authorization", format!("Bearer {DEV_PREFIXED_KEY}"))
            .json(&hello_request(false))
            .await;

        response.assert_status(StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_or_invalid_key_is_rejected_without_metering() {
        let (server, upstream) = server_with(completion("unused"), 100);

        let response = server.post("/v1/messages").json(&hello_request(false)).await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        assert_eq!(response.json::<Value>()["error"]["type"], "authentication_error");
        assert!(response.headers().get(RATE_LIMIT_HEADER).is_none());

        let response = server
            .post("/v1/messages")
            .add_header("x-api-key", "sk-ant-short")
            .json(&hello_request(false))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);

        assert!(upstream.requests().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_request_still_reports_headers() {
        let (server, upstream) = server_with(completion("ok"), 2);

        for expected_remaining in ["1", "0"] {
            let response = server
                .post("/v1/messages")
                .add_header("x-api-key", "test-key")
                .json(&hello_request(false))
                .await;
            response.assert_status(StatusCode::OK);
            assert_eq!(response.header(RATE_REMAINING_HEADER), expected_remaining);
        }

        let response = server
            .post("/v1/messages")
            .add_header("x-api-key", "test-key")
            .json(&hello_request(false))
            .await;
        response.assert_status(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.json::<Value>()["error"]["type"], "rate_limit_error");
        assert_eq!(response.header(RATE_LIMIT_HEADER), "2");
        assert_eq!(response.header(RATE_REMAINING_HEADER), "0");
        let reset: i64 = response.header(RATE_RESET_HEADER).to_str().unwrap().parse().unwrap();
        assert_eq!(reset, 1_704_067_200 + 60);

        assert_eq!(upstream.requests().len(), 2);
    }

    #[tokio::test]
    async fn unparseable_body_is_bad_request() {
        let (server, upstream) = server_with(completion("unused"), 100);

        let response = server
            .post("/v1/messages")
            .add_header("x-api-key", "test-key")
            .json(&json!({"model": "m"}))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<Value>()["error"]["type"], "invalid_request_error");
        assert_eq!(response.header(RATE_REMAINING_HEADER), "99");
        assert!(upstream.requests().is_empty());
    }

    #[tokio::test]
    async fn upstream_error_status_is_propagated() {
        let (server, _upstream) = server_with(
            FakeUpstream::new(FakeReply::Status(StatusCode::SERVICE_UNAVAILABLE, "provider overloaded".into())),
            100,
        );

        let response = server
            .post("/v1/messages")
            .add_header("x-api-key", "test-key")
            .json(&hello_request(false))
            .await;

        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.json::<Value>()["error"]["message"], "provider overloaded");
    }

    #[tokio::test]
    async fn empty_choices_is_bad_gateway() {
        let (server, _upstream) = server_with(
            FakeUpstream::new(FakeReply::Json(TargetResponse {
                id: "x".into(),
                model: "m".into(),
                choices: Vec::new(),
                usage: None,
            })),
            100,
        );

        let response = server
            .post("/v1/messages")
            .add_header("x-api-key", "test-key")
            .json(&hello_request(false))
            .await;

        response.assert_status(StatusCode::BAD_GATEWAY);
        assert_eq!(response.json::<Value>()["error"]["type"], "api_error");
    }

    #[test_log::test(tokio::test)]
    async fn streaming_request_is_transcoded_across_chunk_boundaries() {
        let (server, upstream) = server_with(
            FakeUpstream::streaming(&[
                "data: {\"id\":\"c1\",\"model\":\"gpt\",\"choices\":[{\"message\":{\"role\":\"assistant\"}}]}\n\ndata: {\"choices\":[{\"del",
                "ta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}],\"usage\":{\"completion_tokens\":2}}\n\ndata: [DO",
                "NE]\n\n",
            ]),
            100,
        );

        let response = server
            .post("/v1/messages")
            .add_header("x-api-key", "test-key")
            .json(&hello_request(true))
            .await;

        response.assert_status(StatusCode::OK);
        assert_eq!(response.header(header::CONTENT_TYPE), "text/event-stream");
        assert_eq!(response.header(RATE_REMAINING_HEADER), "99");
        assert_eq!(
            response.text(),
            concat!(
                "data: {\"type\":\"message_start\",\"message\":{\"id\":\"c1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"gpt\",\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":0,\"output_tokens\":0}}}\n\n",
                "\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
                "\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
                "\n",
                "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":2}}\n\n",
                "\n",
                "data: {\"type\":\"message_stop\"}\n\n",
            )
        );

        assert!(upstream.requests()[0].stream);
    }

    #[tokio::test]
    async fn stream_without_done_gets_one_message_stop() {
        let (server, _upstream) = server_with(
            FakeUpstream::streaming(&["data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}"]),
            100,
        );

        let response = server
            .post("/v1/messages")
            .add_header("x-api-key", "test-key")
            .json(&hello_request(true))
            .await;

        assert_eq!(
            response.text(),
            concat!(
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"partial\"}}\n\n",
                "data: {\"type\":\"message_stop\"}\n\n",
            )
        );
    }

    #[tokio::test]
    async fn upstream_read_error_ends_the_stream() {
        let (server, _upstream) = server_with(
            FakeUpstream::new(FakeReply::ChunksThenError(vec![Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"cut\"}}]}\n",
            )])),
            100,
        );

        let response = server
            .post("/v1/messages")
            .add_header("x-api-key", "test-key")
            .json(&hello_request(true))
            .await;

        let text = response.text();
        assert!(text.contains("\"text\":\"cut\""));
        assert!(!text.contains("message_stop"));
    }
}
