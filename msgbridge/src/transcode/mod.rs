//! Protocol transcoding between the messages API (source) and chat completions (target).
//!
//! - [`request::to_target`] rewrites an inbound request for the provider
//! - [`response::to_source`] rewrites a completed provider response for the client
//! - [`stream::StreamTranscoder`] rewrites a provider SSE stream incrementally

pub mod finish_reason;
pub mod models;
pub mod request;
pub mod response;
pub mod stream;

pub use finish_reason::map_finish_reason;
pub use request::to_target;
pub use response::to_source;
pub use stream::{StreamFrame, StreamTranscoder, encode_frames};
