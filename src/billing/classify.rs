//! Event routing
//!
//! Stripe fires overlapping event types for purchases and subscriptions, so
//! the route depends on the type and, for ambiguous types, on whether the
//! payload carries a subscription reference.

use crate::error::{ReconcileError, ReconcileResult};
use crate::stripe::error::StripeWebhookError;
use crate::stripe::events::{CheckoutSession, Charge, PaymentIntent, StripeEvent, StripeEventType};

/// Subscription lifecycle events, always routed to subscription sync
pub const SUBSCRIPTION_EVENTS: &[StripeEventType] = &[
    StripeEventType::SubscriptionCreated,
    StripeEventType::SubscriptionUpdated,
    StripeEventType::SubscriptionDeleted,
    StripeEventType::SubscriptionPaused,
    StripeEventType::SubscriptionResumed,
    StripeEventType::SubscriptionPendingUpdateApplied,
    StripeEventType::SubscriptionPendingUpdateExpired,
    StripeEventType::SubscriptionTrialWillEnd,
    StripeEventType::InvoiceUpcoming,
];

/// Events routed to subscription sync only when they reference a subscription
pub const AMBIGUOUS_EVENTS: &[StripeEventType] = &[
    StripeEventType::CheckoutSessionCompleted,
    StripeEventType::InvoicePaid,
    StripeEventType::InvoicePaymentFailed,
    StripeEventType::InvoicePaymentActionRequired,
    StripeEventType::InvoiceMarkedUncollectible,
    StripeEventType::InvoicePaymentSucceeded,
];

/// A purchase event with its typed payload
#[derive(Debug, Clone)]
pub enum PurchaseEvent {
    /// `checkout.session.completed` in payment mode
    CheckoutCompleted(CheckoutSession),
    /// `payment_intent.payment_failed`
    PaymentFailed(PaymentIntent),
    /// `charge.refunded`
    Refunded(Charge),
}

/// Input for a subscription sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTrigger {
    /// Stripe customer reference
    pub customer_id: String,
    /// Type of the triggering event (a hint for crediting only)
    pub event_type: StripeEventType,
}

/// Routing decision for one event
#[derive(Debug, Clone)]
pub enum Route {
    /// Reconcile a one-time purchase
    Purchase(PurchaseEvent),
    /// Re-sync the customer's subscription
    Subscription(SubscriptionTrigger),
    /// Nothing to do
    Ignore(&'static str),
}

impl Route {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Purchase(_) => "purchase",
            Self::Subscription(_) => "subscription",
            Self::Ignore(_) => "ignore",
        }
    }
}

/// Route a verified event
pub fn classify(event: &StripeEvent) -> ReconcileResult<Route> {
    let event_type = event.typed_event_type();

    match event_type {
        StripeEventType::PaymentIntentFailed => {
            return Ok(Route::Purchase(PurchaseEvent::PaymentFailed(payload(event)?)));
        }
        StripeEventType::ChargeRefunded => {
            return Ok(Route::Purchase(PurchaseEvent::Refunded(payload(event)?)));
        }
        StripeEventType::CheckoutSessionCompleted => {
            let session: CheckoutSession = payload(event)?;
            if session.is_payment_mode() {
                return Ok(Route::Purchase(PurchaseEvent::CheckoutCompleted(session)));
            }
        }
        _ => {}
    }

    if SUBSCRIPTION_EVENTS.contains(&event_type) {
        return subscription_route(event, event_type);
    }

    if AMBIGUOUS_EVENTS.contains(&event_type) {
        if event.object_reference("subscription").is_some() || invoice_parent_subscription(event) {
            return subscription_route(event, event_type);
        }
        return Ok(Route::Ignore("no subscription reference"));
    }

    Ok(Route::Ignore("event type not handled"))
}

fn subscription_route(event: &StripeEvent, event_type: StripeEventType) -> ReconcileResult<Route> {
    if !event.data.object.is_object() {
        return Err(ReconcileError::invalid_payload(format!(
            "{} object is not a JSON object",
            event.event_type
        )));
    }
    let customer_id = event.object_reference("customer").ok_or_else(|| {
        ReconcileError::unattributable(format!("{} names no customer", event.event_type))
    })?;
    Ok(Route::Subscription(SubscriptionTrigger {
        customer_id,
        event_type,
    }))
}

/// Newer API versions move the invoice's subscription under
/// `parent.subscription_details.subscription`
fn invoice_parent_subscription(event: &StripeEvent) -> bool {
    event
        .data
        .object
        .pointer("/parent/subscription_details/subscription")
        .and_then(crate::stripe::events::reference_id)
        .is_some()
}

fn payload<T: serde::de::DeserializeOwned>(event: &StripeEvent) -> ReconcileResult<T> {
    event.object().map_err(|e| match e {
        StripeWebhookError::InvalidPayload(msg) => ReconcileError::InvalidPayload(msg),
        other => ReconcileError::InvalidPayload(other.to_string()),
    })
}
