//! One-time purchase reconciliation
//!
//! Provider reads (payment intent, line items) all happen before the store
//! transaction is opened, so a failed Stripe call leaves nothing half
//! written. Inside the transaction the purchase is read again and the
//! transition re-checked; a concurrent duplicate that committed first turns
//! this attempt into a no-op.
//!
//! Completion records the credits it granted on the purchase row. A refund
//! revokes that recorded amount, never a figure re-derived from Stripe or
//! the current catalog.

use std::sync::Arc;

use crate::billing::classify::PurchaseEvent;
use crate::billing::credits::{apply_credit_change, purchase_credit_change, CreditCause};
use crate::billing::notify::{Notifier, PurchaseNotice};
use crate::billing::{Reconciler, PURCHASE_ID_KEY};
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{Purchase, PurchaseStatus, PurchaseUpdate};
use crate::store::{now, BillingStore};
use crate::stripe::client::PaymentProvider;
use crate::stripe::events::Metadata;

/// Result of reconciling one purchase event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// The purchase moved to `status`
    Applied {
        /// Purchase ID
        purchase_id: String,
        /// Status before the event
        previous: PurchaseStatus,
        /// Status after the event
        status: PurchaseStatus,
        /// Balance change written with it
        credit_delta: i64,
    },
    /// The purchase already has the target status
    Duplicate {
        /// Purchase ID
        purchase_id: String,
        /// Current status
        status: PurchaseStatus,
    },
    /// The transition is not allowed (e.g. completing a refunded purchase)
    Rejected {
        /// Purchase ID
        purchase_id: String,
        /// Current status
        from: PurchaseStatus,
        /// Status the event asked for
        to: PurchaseStatus,
    },
}

/// What the event says, independent of its type
struct PurchaseFacts {
    target: PurchaseStatus,
    payment_intent_id: Option<String>,
    checkout_session_id: Option<String>,
    metadata: Metadata,
}

impl PurchaseFacts {
    fn from_event(event: &PurchaseEvent) -> Self {
        match event {
            PurchaseEvent::CheckoutCompleted(session) => Self {
                target: PurchaseStatus::Completed,
                payment_intent_id: session.payment_intent.as_ref().map(|pi| pi.id().to_string()),
                checkout_session_id: Some(session.id.clone()),
                metadata: session.metadata.clone(),
            },
            PurchaseEvent::PaymentFailed(intent) => Self {
                target: PurchaseStatus::Failed,
                payment_intent_id: Some(intent.id.clone()),
                checkout_session_id: None,
                metadata: intent.metadata.clone(),
            },
            PurchaseEvent::Refunded(charge) => Self {
                target: PurchaseStatus::Refunded,
                payment_intent_id: charge.payment_intent.as_ref().map(|pi| pi.id().to_string()),
                checkout_session_id: None,
                metadata: charge.metadata.clone(),
            },
        }
    }
}

/// Whether `current` already reflects `target`
///
/// A repeated failure is not a duplicate: a later attempt may carry a new
/// payment intent reference.
fn is_duplicate(current: PurchaseStatus, target: PurchaseStatus) -> bool {
    current == target && target != PurchaseStatus::Failed
}

impl<S, P, N> Reconciler<S, P, N>
where
    S: BillingStore,
    P: PaymentProvider,
    N: Notifier,
{
    /// Apply a purchase event
    pub async fn reconcile_purchase(&self, event: PurchaseEvent) -> ReconcileResult<PurchaseOutcome> {
        let mut facts = PurchaseFacts::from_event(&event);

        // The session carries only a reference to its payment intent; the
        // intent's metadata is the fallback for the purchase id. Refund
        // charges without metadata fall back the same way.
        let needs_intent = match &event {
            PurchaseEvent::CheckoutCompleted(_) => true,
            PurchaseEvent::Refunded(_) => !facts.metadata.contains_key(PURCHASE_ID_KEY),
            PurchaseEvent::PaymentFailed(_) => false,
        };
        if needs_intent {
            if let Some(intent_id) = facts.payment_intent_id.clone() {
                let intent = self.provider.retrieve_payment_intent(&intent_id).await?;
                for (key, value) in intent.metadata {
                    facts.metadata.entry(key).or_insert(value);
                }
            }
        }

        let purchase_id = facts
            .metadata
            .get(PURCHASE_ID_KEY)
            .filter(|id| !id.is_empty())
            .cloned()
            .ok_or_else(|| ReconcileError::unattributable("event metadata has no purchaseId"))?;

        let existing = self.store.find_purchase(&purchase_id)?.ok_or_else(|| {
            ReconcileError::unattributable(format!("unknown purchase {purchase_id}"))
        })?;

        // Cheap early exits; both are re-checked inside the transaction
        if is_duplicate(existing.status, facts.target) {
            tracing::info!(
                purchase_id = %purchase_id,
                status = %existing.status,
                "Duplicate purchase event; nothing to do"
            );
            return Ok(PurchaseOutcome::Duplicate {
                purchase_id,
                status: existing.status,
            });
        }
        if !existing.status.can_transition_to(facts.target) {
            tracing::warn!(
                purchase_id = %purchase_id,
                from = %existing.status,
                to = %facts.target,
                "Ignoring out-of-order purchase transition"
            );
            return Ok(PurchaseOutcome::Rejected {
                purchase_id,
                from: existing.status,
                to: facts.target,
            });
        }

        let price_id = self.resolve_price(&facts, &existing).await?;
        let completion_credits = price_id
            .as_deref()
            .map_or(0, |price| self.catalog.one_time_credits(price));

        let target = facts.target;
        let completing = target == PurchaseStatus::Completed;
        let payment_intent_id = facts.payment_intent_id.clone();
        let checkout_session_id = facts.checkout_session_id.clone();
        let completed_at = completing.then(now);

        let outcome = self.store.transaction(|tx| {
            let Some(current) = tx.find_purchase(&purchase_id)? else {
                return Ok(None);
            };

            if is_duplicate(current.status, target) {
                return Ok(Some(PurchaseOutcome::Duplicate {
                    purchase_id: purchase_id.clone(),
                    status: current.status,
                }));
            }
            if !current.status.can_transition_to(target) {
                return Ok(Some(PurchaseOutcome::Rejected {
                    purchase_id: purchase_id.clone(),
                    from: current.status,
                    to: target,
                }));
            }

            let credits = match target {
                PurchaseStatus::Refunded => current.credits_granted,
                _ => completion_credits,
            };
            let delta = purchase_credit_change(current.status, target, credits);

            tx.update_purchase(
                &purchase_id,
                &PurchaseUpdate {
                    status: target,
                    stripe_payment_intent_id: payment_intent_id.clone(),
                    stripe_checkout_session_id: checkout_session_id.clone(),
                    completed_at,
                    credits_granted: completing.then_some(delta),
                },
            )?;

            let cause = if delta < 0 {
                CreditCause::PurchaseRefunded(&purchase_id)
            } else {
                CreditCause::PurchaseCompleted(&purchase_id)
            };
            apply_credit_change(tx, &current.user_id, delta, cause)?;

            Ok(Some(PurchaseOutcome::Applied {
                purchase_id: purchase_id.clone(),
                previous: current.status,
                status: target,
                credit_delta: delta,
            }))
        })?;

        let outcome = outcome.ok_or_else(|| {
            ReconcileError::unattributable(format!("purchase {purchase_id} disappeared"))
        })?;

        if let PurchaseOutcome::Applied {
            status: PurchaseStatus::Completed,
            credit_delta,
            ..
        } = &outcome
        {
            tracing::info!(
                purchase_id = %purchase_id,
                user_id = %existing.user_id,
                credit_delta,
                "Purchase completed"
            );
            let fulfillment_price = price_id.as_deref().unwrap_or(&existing.product_id);
            self.notify_fulfillment(&existing, fulfillment_price, completed_at.unwrap_or_else(now));
        }

        Ok(outcome)
    }

    /// Price bought in this purchase, from the checkout session's line items
    ///
    /// Only completions need it; failures grant nothing and refunds revoke
    /// the recorded grant.
    async fn resolve_price(
        &self,
        facts: &PurchaseFacts,
        existing: &Purchase,
    ) -> ReconcileResult<Option<String>> {
        if facts.target != PurchaseStatus::Completed {
            return Ok(None);
        }

        let session_id = facts
            .checkout_session_id
            .as_deref()
            .or(existing.stripe_checkout_session_id.as_deref());
        let Some(session_id) = session_id else {
            tracing::warn!(
                purchase_id = %existing.id,
                "No checkout session to read line items from; crediting zero"
            );
            return Ok(None);
        };

        let items = self.provider.list_line_items(session_id).await?;
        let price_id = items
            .into_iter()
            .find_map(|item| item.price.map(|price| price.id));
        if price_id.is_none() {
            tracing::warn!(
                purchase_id = %existing.id,
                session_id,
                "Checkout session has no priced line items; crediting zero"
            );
        }
        Ok(price_id)
    }

    fn notify_fulfillment(&self, purchase: &Purchase, price_id: &str, completed_at: i64) {
        let Some(fulfillment) = self.catalog.fulfillment(price_id) else {
            return;
        };

        let email = match self.store.find_user(&purchase.user_id) {
            Ok(user) => user.and_then(|u| u.email),
            Err(e) => {
                tracing::warn!(purchase_id = %purchase.id, error = %e, "Could not load buyer");
                None
            }
        };

        let notice = PurchaseNotice {
            purchase_id: purchase.id.clone(),
            user_id: purchase.user_id.clone(),
            email,
            product_id: price_id.to_string(),
            fulfillment: fulfillment.to_string(),
            amount: purchase.amount,
            currency: purchase.currency.clone(),
            completed_at,
        };
        let notifier = Arc::clone(&self.notifier);

        tokio::spawn(async move {
            if let Err(e) = notifier.purchase_completed(&notice).await {
                tracing::error!(
                    purchase_id = %notice.purchase_id,
                    error = %e,
                    "Fulfillment notification failed"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rules() {
        use PurchaseStatus::*;
        assert!(is_duplicate(Completed, Completed));
        assert!(is_duplicate(Refunded, Refunded));
        assert!(!is_duplicate(Failed, Failed));
        assert!(!is_duplicate(Pending, Completed));
    }
}
