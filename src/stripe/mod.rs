//! Stripe Webhook Module
//!
//! Receiving side of the Stripe integration:
//!
//! - **Signature Verification**: HMAC-SHA256 validation of the `stripe-signature` header
//! - **Idempotency**: Deduplication of webhook deliveries using event IDs
//! - **Async Processing**: The delivery is acknowledged once queued; a background
//!   worker reconciles it with retries and a timeout
//! - **Provider Client**: The read calls reconciliation needs from the Stripe API
//!
//! # Architecture
//!
//! ```text
//! Request -> Signature Verify -> Idempotency Check -> Queue -> Ack (200)
//!                   |                    |              |
//!                   v                    v              v
//!                  400           200 (duplicate)   EventProcessor -> EventHandler
//! ```
//!
//! # Security
//!
//! - Webhook signing secret loaded from the environment
//! - Constant-time signature comparison
//! - Signature checked against the raw body, before any JSON parsing
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use creditsync::stripe::{
//!     stripe_webhook_router, EventHandler, EventProcessor, InMemoryIdempotencyStore,
//!     StripeEvent, StripeWebhookConfig, StripeWebhookState,
//! };
//!
//! struct LogEvents;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for LogEvents {
//!     async fn handle_event(&self, event: &StripeEvent) -> creditsync::error::ReconcileResult<()> {
//!         tracing::info!(event_id = %event.id, "received");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = StripeWebhookConfig::from_env()?;
//! let store = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600), 10_000));
//! let (processor, handle) = EventProcessor::new(Arc::new(LogEvents), store, config.clone());
//! tokio::spawn(handle.run());
//!
//! let state = Arc::new(StripeWebhookState::new(&config, Arc::new(processor)));
//! let app = stripe_webhook_router(state);
//! // ... serve with axum
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod idempotency;
pub mod processor;
pub mod signature;

// Re-export commonly used items
pub use client::{PaymentProvider, StripeClient};
pub use config::StripeWebhookConfig;
pub use error::{StripeWebhookError, StripeWebhookResult};
pub use events::{StripeEvent, StripeEventType, SubscriptionStatus};
pub use handler::{stripe_webhook_handler, stripe_webhook_router, StripeWebhookState};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
pub use processor::{EventHandler, EventOutcome, EventProcessor, ProcessorHandle, ProcessorStats};
pub use signature::SignatureVerifier;
