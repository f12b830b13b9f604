//! HTTP request handlers.
//!
//! - [`messages`]: the messages endpoint, including key extraction and rate-limit headers
//!
//! Handlers return [`crate::errors::Error`] values as responses, which render the
//! `{"type": "error", ...}` envelope clients expect.

pub mod messages;
