//! Stripe webhook boundary errors
//!
//! These are the only errors that influence the HTTP status returned to
//! Stripe. Everything that goes wrong after an event is queued is reported
//! through logs and the idempotency store instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors raised while receiving a webhook delivery
#[derive(Error, Debug)]
pub enum StripeWebhookError {
    /// The `stripe-signature` header or the body is absent
    #[error("Missing signature: {0}")]
    MissingSignature(String),

    /// The signature header is malformed, stale or does not match
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// The body is signed correctly but is not a Stripe event
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The background queue refused the event
    #[error("Event queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Missing or invalid webhook configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StripeWebhookError {
    /// HTTP status returned to Stripe for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSignature(_) | Self::InvalidSignature(_) | Self::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the delivery was rejected before any processing was attempted
    pub fn is_rejection(&self) -> bool {
        self.status_code() == StatusCode::BAD_REQUEST
    }
}

impl IntoResponse for StripeWebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Signature failures get a generic message; details stay in the logs.
        let message = match &self {
            Self::MissingSignature(_) | Self::InvalidSignature(_) => "Invalid signature".to_string(),
            Self::InvalidPayload(_) => "Invalid payload".to_string(),
            Self::QueueUnavailable(_) => "Temporarily unavailable".to_string(),
            Self::ConfigError(_) => "Internal error".to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Result type alias for webhook boundary operations
pub type StripeWebhookResult<T> = std::result::Result<T, StripeWebhookError>;
