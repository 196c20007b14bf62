//! Error types for creditsync
//!
//! This module provides the error hierarchy shared by the reconciliation
//! pipeline. Webhook boundary errors live in [`crate::stripe::error`]; the
//! types here describe failures that happen after an event was accepted.

use thiserror::Error;

use crate::stripe::error::StripeWebhookError;

/// The main error type for creditsync operations
#[derive(Error, Debug)]
pub enum Error {
    /// Webhook boundary errors (signature, payload)
    #[error("Webhook error: {0}")]
    Webhook(#[from] StripeWebhookError),

    /// Reconciliation errors
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// Data store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Payment provider errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of a single reconciliation attempt.
///
/// Only [`ReconcileError::Provider`] and [`ReconcileError::Transaction`] are
/// worth retrying; the event itself will not change on a second look.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The event lacks what is needed to find a local record
    #[error("Unattributable event: {0}")]
    Unattributable(String),

    /// The event object does not match the schema for its type
    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    /// A payment provider query failed before any write happened
    #[error("Provider query failed: {0}")]
    Provider(#[from] ProviderError),

    /// The store transaction failed and was rolled back
    #[error("Transaction failed: {0}")]
    Transaction(#[from] StoreError),
}

impl ReconcileError {
    /// Create an unattributable-event error from a string
    pub fn unattributable<S: Into<String>>(msg: S) -> Self {
        ReconcileError::Unattributable(msg.into())
    }

    /// Create an invalid-payload error from a string
    pub fn invalid_payload<S: Into<String>>(msg: S) -> Self {
        ReconcileError::InvalidPayload(msg.into())
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::Transaction(_))
    }

    /// Whether the event should be acknowledged as handled despite the error
    pub fn is_unattributable(&self) -> bool {
        matches!(self, Self::Unattributable(_))
    }
}

/// Payment provider API errors
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Transport-level failure (DNS, TLS, timeout)
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The provider answered with a non-success status
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error body returned by the provider
        message: String,
    },

    /// The provider response could not be decoded
    #[error("Unexpected response: {0}")]
    Decode(String),
}

/// Data store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A row required by the operation does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (purchase, user, subscription)
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// A stored value could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Create a not-found error
    pub fn not_found<S: Into<String>>(entity: &'static str, id: S) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Result type alias for creditsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for reconciliation attempts
pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Reconcile(ReconcileError::unattributable("missing purchaseId"));
        assert!(err.to_string().contains("Unattributable event"));
        assert!(err.to_string().contains("missing purchaseId"));
    }

    #[test]
    fn test_provider_error() {
        let err = ProviderError::Api {
            status: 404,
            message: "No such payment_intent".to_string(),
        };
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("No such payment_intent"));
    }

    #[test]
    fn test_retryable_classification() {
        let provider = ReconcileError::from(ProviderError::Decode("bad json".into()));
        assert!(provider.is_retryable());

        let store = ReconcileError::from(StoreError::not_found("purchase", "p_1"));
        assert!(store.is_retryable());

        assert!(!ReconcileError::unattributable("unknown customer").is_retryable());
        assert!(!ReconcileError::invalid_payload("not an invoice").is_retryable());
        assert!(ReconcileError::unattributable("x").is_unattributable());
    }

    #[test]
    fn test_store_not_found() {
        let err = StoreError::not_found("purchase", "pur_123");
        assert_eq!(err.to_string(), "purchase not found: pur_123");
    }
}
