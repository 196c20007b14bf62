//! Billing reconciliation
//!
//! Turns verified Stripe events into purchase, subscription and credit
//! changes.
//!
//! ```text
//! StripeEvent ──▶ classify ──┬─▶ Purchase      ──▶ purchase row + credits ─┐
//!                            ├─▶ Subscription  ──▶ re-fetch + overwrite    ├─▶ one store transaction
//!                            │                     + credits ──────────────┘
//!                            └─▶ Ignore
//! ```
//!
//! Stripe gives no ordering guarantee and delivers at least once. Purchases
//! are protected by re-checking the stored status inside the write
//! transaction; subscriptions are never patched from the payload but pulled
//! fresh from Stripe on every relevant event.

pub mod classify;
pub mod credits;
pub mod notify;
pub mod purchase;
pub mod subscription;

use std::sync::Arc;

use tracing::Instrument;

pub use classify::{classify, PurchaseEvent, Route, SubscriptionTrigger};
pub use credits::{CreditGrant, GrantReason, PriceCatalog};
pub use notify::{ConfiguredNotifier, LogNotifier, Notifier, PurchaseNotice, ResendNotifier};
pub use purchase::PurchaseOutcome;
pub use subscription::SyncOutcome;

use crate::error::ReconcileResult;
use crate::store::BillingStore;
use crate::stripe::client::PaymentProvider;
use crate::stripe::events::StripeEvent;
use crate::stripe::processor::EventHandler;

/// Metadata key carrying the local purchase id
pub const PURCHASE_ID_KEY: &str = "purchaseId";

/// Reconciles events against the store, asking Stripe where needed
pub struct Reconciler<S, P, N> {
    store: Arc<S>,
    provider: Arc<P>,
    notifier: Arc<N>,
    catalog: Arc<PriceCatalog>,
}

impl<S, P, N> Reconciler<S, P, N>
where
    S: BillingStore,
    P: PaymentProvider,
    N: Notifier,
{
    /// Create a reconciler from its collaborators
    pub fn new(store: Arc<S>, provider: Arc<P>, notifier: Arc<N>, catalog: PriceCatalog) -> Self {
        Self {
            store,
            provider,
            notifier,
            catalog: Arc::new(catalog),
        }
    }

    /// The store this reconciler writes to
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The price catalog
    pub fn catalog(&self) -> &PriceCatalog {
        &self.catalog
    }

    async fn dispatch(&self, event: &StripeEvent) -> ReconcileResult<()> {
        let route = classify(event)?;
        tracing::debug!(route = route.name(), "Event classified");

        match route {
            Route::Ignore(reason) => {
                tracing::debug!(reason, "Event ignored");
            }
            Route::Purchase(purchase_event) => {
                let outcome = self.reconcile_purchase(purchase_event).await?;
                tracing::info!(outcome = ?outcome, "Purchase reconciled");
            }
            Route::Subscription(trigger) => {
                let outcome = self.sync_subscription(&trigger).await?;
                tracing::info!(
                    customer_id = %trigger.customer_id,
                    outcome = ?outcome,
                    "Subscription synced"
                );
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S, P, N> EventHandler for Reconciler<S, P, N>
where
    S: BillingStore,
    P: PaymentProvider,
    N: Notifier,
{
    async fn handle_event(&self, event: &StripeEvent) -> ReconcileResult<()> {
        let span = tracing::info_span!(
            "reconcile",
            event_id = %event.id,
            event_type = %event.event_type,
        );
        self.dispatch(event).instrument(span).await
    }
}
