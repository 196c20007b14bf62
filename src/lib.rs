//! creditsync - Stripe payment-event reconciliation
//!
//! Receives Stripe webhooks, verifies them, and keeps local purchases,
//! subscriptions and credit balances consistent with what Stripe reports,
//! under at-least-once and out-of-order delivery.
//!
//! # Features
//!
//! - **Webhook Endpoint**: Signature verification, event-id deduplication and
//!   immediate acknowledgement
//! - **Purchase Reconciliation**: Monotonic status transitions with credits
//!   applied in the same transaction
//! - **Subscription Sync**: Full overwrite from a fresh provider fetch,
//!   never a patch from the payload
//! - **Credit Ledger**: Activation, renewal and plan-change grants from a
//!   static price table
//!
//! # Architecture
//!
//! ```text
//! Stripe ──▶ /webhooks/stripe ──▶ EventProcessor (queue + retries)
//!                                        │
//!                                        ▼
//!                                   Reconciler
//!                                   │        │
//!                          ┌────────┘        └────────┐
//!                          ▼                          ▼
//!                   PaymentProvider              BillingStore
//!                   (Stripe REST API)        (SQLite, one transaction
//!                                             per state change)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use creditsync::billing::{LogNotifier, PriceCatalog, Reconciler};
//! use creditsync::store::SqliteStore;
//! use creditsync::stripe::{
//!     stripe_webhook_router, EventProcessor, InMemoryIdempotencyStore, StripeClient,
//!     StripeWebhookConfig, StripeWebhookState,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StripeWebhookConfig::from_env()?;
//!     let reconciler = Reconciler::new(
//!         Arc::new(SqliteStore::open("creditsync.db")?),
//!         Arc::new(StripeClient::new("sk_test_...")?),
//!         Arc::new(LogNotifier),
//!         PriceCatalog::load("config/prices.json")?,
//!     );
//!     let idempotency = Arc::new(InMemoryIdempotencyStore::new(
//!         config.idempotency_ttl,
//!         config.idempotency_max_entries,
//!     ));
//!     let (processor, handle) = EventProcessor::new(Arc::new(reconciler), idempotency, config.clone());
//!     tokio::spawn(handle.run());
//!
//!     let app = stripe_webhook_router(Arc::new(StripeWebhookState::new(&config, Arc::new(processor))));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod billing;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod store;
pub mod stripe;

// Re-exports for convenience
pub use billing::{PriceCatalog, Reconciler};
pub use error::{Error, Result};
pub use models::{Purchase, PurchaseStatus, SubscriptionRecord, User};
pub use store::{BillingStore, MemoryStore, SqliteStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
