use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// API key missing from the request or rejected by the admission policy
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// The key used up its request budget for the current window
    #[error("Rate limit of {limit} requests exceeded until {reset_at}")]
    RateLimited { limit: u32, reset_at: DateTime<Utc> },

    /// Request body could not be read as a messages request
    #[error("{message}")]
    BadRequest { message: String },

    /// Upstream answered successfully but without a field the transcoder needs
    #[error("Malformed upstream response: {message}")]
    MalformedUpstream { message: String },

    /// Upstream answered with a non-2xx status or could not be reached
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: StatusCode, message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::MalformedUpstream { .. } => StatusCode::BAD_GATEWAY,
            Error::Upstream { status, .. } if status.is_client_error() || status.is_server_error() => *status,
            Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error `type` reported to clients inside the error envelope
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Unauthenticated { .. } => "authentication_error",
            Error::RateLimited { .. } => "rate_limit_error",
            Error::BadRequest { .. } => "invalid_request_error",
            Error::Upstream { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
            Error::Upstream { status, .. } if *status == StatusCode::UNAUTHORIZED => "authentication_error",
            Error::Upstream { status, .. } if *status == StatusCode::FORBIDDEN => "permission_error",
            Error::Upstream { status, .. } if status.is_client_error() => "invalid_request_error",
            Error::MalformedUpstream { .. } | Error::Upstream { .. } | Error::Internal { .. } | Error::Other(_) => "api_error",
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::RateLimited { limit, .. } => format!("Rate limit of {limit} requests per window exceeded. Please retry later."),
            Error::BadRequest { message } => message.clone(),
            Error::MalformedUpstream { .. } => "Upstream provider returned an unexpected response".to_string(),
            Error::Upstream { message, .. } => message.clone(),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::MalformedUpstream { .. } | Error::Upstream { .. } => {
                tracing::warn!("Upstream error: {}", self);
            }
            Error::Unauthenticated { .. } | Error::RateLimited { .. } => {
                tracing::info!("Admission error: {}", self);
            }
            Error::BadRequest { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let body = json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.user_message(),
            }
        });

        (self.status_code(), Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
