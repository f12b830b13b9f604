//! Incremental transcoding of a chat-completions SSE stream into messages stream events.
//!
//! Input arrives as arbitrary byte chunks. Bytes are buffered until a full line is available,
//! so lines and multi-byte characters split across chunks are reassembled before parsing.
//! Each complete line maps to at most one output frame, in input order.

use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

use super::finish_reason::map_finish_reason;
use super::models::{
    BlockDelta, DeltaUsage, MessageDeltaBody, MessageType, SourceResponse, SourceRole, SourceStreamEvent, SourceUsage,
    TargetStreamChunk,
};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// One unit of output, ready to be written to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Event(SourceStreamEvent),
    /// A blank separator line passed through from upstream
    Separator,
}

impl StreamFrame {
    /// Wire form: `data: <json>\n\n` for events, `\n` for separators.
    pub fn to_sse(&self) -> Bytes {
        match self {
            StreamFrame::Separator => Bytes::from_static(b"\n"),
            StreamFrame::Event(event) => match serde_json::to_string(event) {
                Ok(json) => Bytes::from(format!("{DATA_PREFIX}{json}\n\n")),
                Err(e) => {
                    tracing::error!("Failed to serialize stream event: {}", e);
                    Bytes::new()
                }
            },
        }
    }

    pub fn is_message_stop(&self) -> bool {
        matches!(self, StreamFrame::Event(SourceStreamEvent::MessageStop))
    }
}

/// Concatenate the wire form of `frames`.
pub fn encode_frames(frames: &[StreamFrame]) -> Bytes {
    let mut out = BytesMut::new();
    for frame in frames {
        out.extend_from_slice(&frame.to_sse());
    }
    out.freeze()
}

/// Stateful parser for one upstream stream. Not shared between requests.
#[derive(Debug, Default)]
pub struct StreamTranscoder {
    buffer: BytesMut,
    finished: bool,
}

impl StreamTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` has been seen. All further input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume one chunk and return every frame its complete lines produce.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }

        self.buffer.extend_from_slice(chunk);
        loop {
            if self.finished {
                self.buffer.clear();
                break;
            }
            let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line = self.buffer.split_to(newline + 1);
            if let Some(frame) = self.process_line(&line[..newline]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush an unterminated final line, if any. Call once the upstream has closed.
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        if self.finished || self.buffer.is_empty() {
            return Vec::new();
        }
        let line = self.buffer.split();
        self.process_line(&line).into_iter().collect()
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<StreamFrame> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() {
            return Some(StreamFrame::Separator);
        }

        let line = String::from_utf8_lossy(raw);
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            trace!(line = %line, "Dropping non-data SSE line");
            return None;
        };

        if payload.trim() == DONE_SENTINEL {
            self.finished = true;
            return Some(StreamFrame::Event(SourceStreamEvent::MessageStop));
        }

        match serde_json::from_str::<TargetStreamChunk>(payload) {
            Ok(chunk) => classify(chunk).map(StreamFrame::Event),
            Err(e) => {
                warn!(error = %e, "Skipping malformed upstream stream frame");
                None
            }
        }
    }
}

/// Map one upstream chunk onto the source event it implies, if any.
fn classify(chunk: TargetStreamChunk) -> Option<SourceStreamEvent> {
    let TargetStreamChunk { id, model, choices, usage } = chunk;
    let choice = choices.into_iter().next()?;

    if let Some(text) = choice.delta.as_ref().and_then(|delta| delta.content.as_deref())
        && !text.is_empty()
    {
        return Some(SourceStreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::TextDelta { text: text.to_string() },
        });
    }

    if choice.message.is_some() && choice.delta.is_none() {
        return Some(SourceStreamEvent::MessageStart {
            message: SourceResponse {
                id: id.unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
                kind: MessageType::Message,
                role: SourceRole::Assistant,
                content: Vec::new(),
                model: model.unwrap_or_default(),
                stop_reason: None,
                stop_sequence: None,
                usage: SourceUsage::default(),
            },
        });
    }

    if let Some(reason) = choice.finish_reason.as_deref() {
        return Some(SourceStreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(map_finish_reason(reason).to_string()),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: usage.map(|u| u.completion_tokens).unwrap_or(0),
            },
        });
    }

    None
}
