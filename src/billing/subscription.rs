//! Subscription sync
//!
//! The local row is a mirror of Stripe, never a patch: every relevant event
//! re-fetches the customer's most recent subscription and overwrites all
//! fields. Only the first (most recent) subscription is considered; a
//! customer is assumed to hold at most one.

use crate::billing::classify::SubscriptionTrigger;
use crate::billing::credits::{
    apply_credit_change, subscription_credit_grant, CreditCause, CreditGrant,
};
use crate::billing::notify::Notifier;
use crate::billing::Reconciler;
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::SubscriptionRecord;
use crate::store::{now, BillingStore};
use crate::stripe::client::PaymentProvider;
use crate::stripe::events::Subscription;

/// Result of a subscription sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The row now mirrors `subscription_id`
    Synced {
        /// Stripe subscription reference
        subscription_id: String,
        /// Provider status, verbatim
        status: String,
        /// Credits granted with the overwrite, if a rule fired
        grant: Option<CreditGrant>,
    },
    /// Stripe reports no subscription; the row was set to `"none"`
    Cleared,
}

/// Build the local mirror of `subscription`
pub fn mirror_subscription(
    user_id: &str,
    customer_id: &str,
    subscription: &Subscription,
    synced_at: i64,
) -> SubscriptionRecord {
    let price = subscription.primary_price();
    let card = subscription.card_details();

    SubscriptionRecord {
        user_id: user_id.to_string(),
        stripe_customer_id: customer_id.to_string(),
        stripe_subscription_id: Some(subscription.id.clone()),
        stripe_price_id: price.map(|p| p.id.clone()),
        interval: price
            .and_then(|p| p.recurring.as_ref())
            .map(|r| r.interval.clone()),
        status: subscription.status.clone(),
        current_period_start: subscription.period_start(),
        current_period_end: subscription.period_end(),
        cancel_at_period_end: subscription.cancel_at_period_end,
        payment_method_brand: card.map(|(brand, _)| brand.to_string()),
        payment_method_last4: card.map(|(_, last4)| last4.to_string()),
        credited_period_start: None,
        updated_at: synced_at,
    }
}

impl<S, P, N> Reconciler<S, P, N>
where
    S: BillingStore,
    P: PaymentProvider,
    N: Notifier,
{
    /// Re-sync a customer's subscription from Stripe
    pub async fn sync_subscription(
        &self,
        trigger: &SubscriptionTrigger,
    ) -> ReconcileResult<SyncOutcome> {
        let customer_id = trigger.customer_id.as_str();
        let user = self
            .store
            .find_user_by_customer(customer_id)?
            .ok_or_else(|| ReconcileError::unattributable(format!("unknown customer {customer_id}")))?;

        let subscriptions = self.provider.list_subscriptions(customer_id, 1).await?;
        let synced_at = now();

        let Some(subscription) = subscriptions.into_iter().next() else {
            let cleared = SubscriptionRecord::none(&user.id, customer_id, synced_at);
            self.store.transaction(|tx| tx.upsert_subscription(&cleared))?;
            tracing::info!(
                customer_id,
                user_id = %user.id,
                "Customer has no subscription; cleared local record"
            );
            return Ok(SyncOutcome::Cleared);
        };

        let mut next = mirror_subscription(&user.id, customer_id, &subscription, synced_at);
        let catalog = &self.catalog;
        let event_type = trigger.event_type;

        let grant = self.store.transaction(|tx| {
            let prior = tx
                .find_subscription(&user.id)?
                .filter(SubscriptionRecord::is_present);
            let grant = subscription_credit_grant(prior.as_ref(), &next, event_type, catalog);

            next.credited_period_start = match grant {
                Some(_) => next.current_period_start,
                None => prior.as_ref().and_then(|p| p.credited_period_start),
            };
            tx.upsert_subscription(&next)?;

            if let Some(grant) = grant {
                apply_credit_change(
                    tx,
                    &user.id,
                    grant.amount,
                    CreditCause::Subscription(grant.reason, &subscription.id),
                )?;
            }
            Ok(grant)
        })?;

        tracing::info!(
            customer_id,
            user_id = %user.id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            credit_delta = grant.map_or(0, |g| g.amount),
            "Subscription mirrored"
        );

        Ok(SyncOutcome::Synced {
            subscription_id: subscription.id,
            status: subscription.status,
            grant,
        })
    }
}
