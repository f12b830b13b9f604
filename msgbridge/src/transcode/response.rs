use super::finish_reason::map_finish_reason;
use super::models::{ContentBlock, MessageType, SourceResponse, SourceRole, SourceUsage, TargetResponse};
use crate::errors::{Error, Result};

/// Translate a completed chat-completions response into a messages response.
///
/// Only the first choice is used. `model` is reported as `original_model` rather than
/// whatever the provider echoed, so clients see the name they asked for.
pub fn to_source(response: TargetResponse, original_model: &str) -> Result<SourceResponse> {
    let TargetResponse { id, choices, usage, .. } = response;

    let choice = choices.into_iter().next().ok_or_else(|| Error::MalformedUpstream {
        message: format!("response {id} has no choices"),
    })?;

    let usage = usage.unwrap_or_default();

    Ok(SourceResponse {
        id,
        kind: MessageType::Message,
        role: SourceRole::Assistant,
        content: vec![ContentBlock::text(choice.message.content.unwrap_or_default())],
        model: original_model.to_string(),
        stop_reason: choice.finish_reason.as_deref().map(|reason| map_finish_reason(reason).to_string()),
        stop_sequence: None,
        usage: SourceUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::request::to_target;
    use serde_json::json;

    fn target_response(value: serde_json::Value) -> TargetResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn maps_first_choice_and_usage() {
        let source = to_source(
            target_response(json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o-2024-08-06",
                "choices": [
                    {"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "length"},
                    {"index": 1, "message": {"role": "assistant", "content": "ignored"}, "finish_reason": "stop"}
                ],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
            })),
            "claude-3-opus",
        )
        .unwrap();

        assert_eq!(
            serde_json::to_value(&source).unwrap(),
            json!({
                "id": "chatcmpl-1",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "Hello!"}],
                "model": "claude-3-opus",
                "stop_reason": "max_tokens",
                "stop_sequence": null,
                "usage": {"input_tokens": 12, "output_tokens": 3}
            })
        );
    }

    #[test]
    fn missing_usage_and_content_default_to_zero_and_empty() {
        let source = to_source(
            target_response(json!({
                "id": "x",
                "model": "m",
                "choices": [{"message": {"role": "assistant", "content": null}, "finish_reason": "weird"}]
            })),
            "m",
        )
        .unwrap();

        assert_eq!(source.content, vec![ContentBlock::text("")]);
        assert_eq!(source.usage, SourceUsage::default());
        assert_eq!(source.stop_reason.as_deref(), Some("weird"));
    }

    #[test]
    fn empty_choices_is_malformed_upstream() {
        let err = to_source(target_response(json!({"id": "x", "model": "m", "choices": []})), "m").unwrap_err();
        assert!(matches!(err, Error::MalformedUpstream { .. }));

        let err = to_source(target_response(json!({"id": "x", "model": "m"})), "m").unwrap_err();
        assert!(matches!(err, Error::MalformedUpstream { .. }));
    }

    #[test]
    fn model_identity_survives_round_trip() {
        let request: crate::transcode::models::SourceRequest = serde_json::from_value(json!({
            "model": "claude-3-haiku",
            "messages": [{"role": "user", "content": "What is 2+2?"}]
        }))
        .unwrap();
        let target = to_target(&request);
        let last_user = target.messages.last().unwrap().content.clone();

        let response = TargetResponse {
            id: "r".into(),
            model: "provider-echoed-model".into(),
            choices: vec![crate::transcode::models::TargetChoice {
                message: crate::transcode::models::TargetResponseMessage {
                    role: Some("assistant".into()),
                    content: Some(last_user),
                },
                finish_reason: Some("stop".into()),
            }],
            usage: None,
        };

        let source = to_source(response, &request.model).unwrap();
        assert_eq!(source.model, "claude-3-haiku");
        assert_eq!(source.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(source.content, vec![ContentBlock::text("What is 2+2?")]);
    }
}
