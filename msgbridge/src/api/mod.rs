//! API layer for HTTP request handling.
//!
//! # Routes
//!
//! - `POST /v1/messages`: messages-API endpoint, forwarded to the chat-completions provider
//! - `GET /healthz`: liveness probe
//!
//! Wire types live in [`crate::transcode::models`].

pub mod handlers;
