//! Wire types for both schemas.
//!
//! Source types are what clients send and receive (messages API). Target types are what the
//! upstream chat-completions provider accepts and returns. Target response types are lenient:
//! fields the transcoder does not need are optional or defaulted so minor provider
//! differences do not fail the request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---- Source schema: inbound request ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRole {
    User,
    Assistant,
}

/// Message content: either a plain string or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<&str> for SourceContent {
    fn from(text: &str) -> Self {
        SourceContent::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    /// Image payload, kept opaque
    Image(Map<String, Value>),
    /// Any block type this gateway does not know about
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub role: SourceRole,
    pub content: SourceContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRequest {
    pub model: String,
    pub messages: Vec<SourceMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SourceContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Accepted for compatibility; the target schema has no equivalent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SourceRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

// ---- Target schema: outbound request ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetRole {
    System,
    User,
    Assistant,
}

impl From<SourceRole> for TargetRole {
    fn from(role: SourceRole) -> Self {
        match role {
            SourceRole::User => TargetRole::User,
            SourceRole::Assistant => TargetRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMessage {
    pub role: TargetRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRequest {
    pub model: String,
    pub messages: Vec<TargetMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    pub stream: bool,
}

// ---- Target schema: responses ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetResponseMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetChoice {
    pub message: TargetResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Completed (non-streaming) chat-completions response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResponse {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub choices: Vec<TargetChoice>,
    #[serde(default)]
    pub usage: Option<TargetUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetStreamChoice {
    #[serde(default)]
    pub delta: Option<TargetDelta>,
    #[serde(default)]
    pub message: Option<TargetResponseMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One `data:` frame of a streamed chat-completions response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetStreamChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<TargetStreamChoice>,
    #[serde(default)]
    pub usage: Option<TargetUsage>,
}

// ---- Source schema: responses and stream events ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Message,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub role: SourceRole,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: SourceUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaUsage {
    pub output_tokens: u32,
}

/// Events emitted to streaming clients, serialized as `{"type": "<snake_case name>", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceStreamEvent {
    MessageStart { message: SourceResponse },
    ContentBlockDelta { index: u32, delta: BlockDelta },
    MessageDelta { delta: MessageDeltaBody, usage: DeltaUsage },
    MessageStop,
}
