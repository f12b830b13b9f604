use super::models::{ContentBlock, SourceContent, SourceRequest, TargetMessage, TargetRequest, TargetRole};

/// Stands in for content blocks the target schema cannot carry.
pub const IMAGE_PLACEHOLDER: &str = "[Image content not supported]";

/// Reduce message content to the single string the target schema expects.
///
/// Blocks are joined with `\n` in order; non-text blocks become [`IMAGE_PLACEHOLDER`].
pub fn flatten_content(content: &SourceContent) -> String {
    match content {
        SourceContent::Text(text) => text.clone(),
        SourceContent::Blocks(blocks) => blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.as_str(),
                ContentBlock::Image(_) | ContentBlock::Unsupported => IMAGE_PLACEHOLDER,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Translate a messages request into a chat-completions request.
///
/// `model` is copied verbatim and absent sampling fields stay absent.
pub fn to_target(request: &SourceRequest) -> TargetRequest {
    let system = request.system.as_ref().map(|system| TargetMessage {
        role: TargetRole::System,
        content: flatten_content(system),
    });

    let messages = system
        .into_iter()
        .chain(request.messages.iter().map(|message| TargetMessage {
            role: message.role.into(),
            content: flatten_content(&message.content),
        }))
        .collect();

    TargetRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone().filter(|stop| !stop.is_empty()),
        stream: request.is_streaming(),
    }
}
