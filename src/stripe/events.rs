//! Stripe Event Types
//!
//! Strongly-typed representations of the Stripe objects the reconcilers read:
//! the event envelope, checkout sessions, payment intents, charges, invoices
//! and subscriptions. Only the fields we use are modelled; everything else in
//! the payload is ignored.

use std::collections::HashMap;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::stripe::error::{StripeWebhookError, StripeWebhookResult};

/// Stripe event types we route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StripeEventType {
    // Checkout / payment events
    #[serde(rename = "checkout.session.completed")]
    CheckoutSessionCompleted,
    #[serde(rename = "payment_intent.payment_failed")]
    PaymentIntentFailed,
    #[serde(rename = "charge.refunded")]
    ChargeRefunded,

    // Subscription lifecycle events
    #[serde(rename = "customer.subscription.created")]
    SubscriptionCreated,
    #[serde(rename = "customer.subscription.updated")]
    SubscriptionUpdated,
    #[serde(rename = "customer.subscription.deleted")]
    SubscriptionDeleted,
    #[serde(rename = "customer.subscription.paused")]
    SubscriptionPaused,
    #[serde(rename = "customer.subscription.resumed")]
    SubscriptionResumed,
    #[serde(rename = "customer.subscription.pending_update_applied")]
    SubscriptionPendingUpdateApplied,
    #[serde(rename = "customer.subscription.pending_update_expired")]
    SubscriptionPendingUpdateExpired,
    #[serde(rename = "customer.subscription.trial_will_end")]
    SubscriptionTrialWillEnd,

    // Invoice events
    #[serde(rename = "invoice.upcoming")]
    InvoiceUpcoming,
    #[serde(rename = "invoice.paid")]
    InvoicePaid,
    #[serde(rename = "invoice.payment_failed")]
    InvoicePaymentFailed,
    #[serde(rename = "invoice.payment_action_required")]
    InvoicePaymentActionRequired,
    #[serde(rename = "invoice.marked_uncollectible")]
    InvoiceMarkedUncollectible,
    #[serde(rename = "invoice.payment_succeeded")]
    InvoicePaymentSucceeded,

    // Catch-all for events we don't explicitly handle
    #[serde(other)]
    Unknown,
}

impl FromStr for StripeEventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "payment_intent.payment_failed" => Self::PaymentIntentFailed,
            "charge.refunded" => Self::ChargeRefunded,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "customer.subscription.paused" => Self::SubscriptionPaused,
            "customer.subscription.resumed" => Self::SubscriptionResumed,
            "customer.subscription.pending_update_applied" => {
                Self::SubscriptionPendingUpdateApplied
            }
            "customer.subscription.pending_update_expired" => {
                Self::SubscriptionPendingUpdateExpired
            }
            "customer.subscription.trial_will_end" => Self::SubscriptionTrialWillEnd,
            "invoice.upcoming" => Self::InvoiceUpcoming,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "invoice.payment_action_required" => Self::InvoicePaymentActionRequired,
            "invoice.marked_uncollectible" => Self::InvoiceMarkedUncollectible,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            _ => Self::Unknown,
        })
    }
}

impl StripeEventType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::PaymentIntentFailed => "payment_intent.payment_failed",
            Self::ChargeRefunded => "charge.refunded",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::SubscriptionPaused => "customer.subscription.paused",
            Self::SubscriptionResumed => "customer.subscription.resumed",
            Self::SubscriptionPendingUpdateApplied => {
                "customer.subscription.pending_update_applied"
            }
            Self::SubscriptionPendingUpdateExpired => {
                "customer.subscription.pending_update_expired"
            }
            Self::SubscriptionTrialWillEnd => "customer.subscription.trial_will_end",
            Self::InvoiceUpcoming => "invoice.upcoming",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::InvoicePaymentActionRequired => "invoice.payment_action_required",
            Self::InvoiceMarkedUncollectible => "invoice.marked_uncollectible",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for StripeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic Stripe event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    /// Unique identifier for the event
    pub id: String,

    /// Type of event
    #[serde(rename = "type")]
    pub event_type: String,

    /// Time of event creation (Unix timestamp)
    pub created: i64,

    /// API version used to render data
    #[serde(default)]
    pub api_version: Option<String>,

    /// Whether this is a live mode event
    #[serde(default)]
    pub livemode: bool,

    /// Number of times Stripe has attempted to deliver
    #[serde(default)]
    pub pending_webhooks: u32,

    /// Object containing event data
    pub data: EventData,
}

impl StripeEvent {
    /// Parse from raw JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> StripeWebhookResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| StripeWebhookError::InvalidPayload(e.to_string()))
    }

    /// Get the typed event type
    pub fn typed_event_type(&self) -> StripeEventType {
        StripeEventType::from_str(&self.event_type).unwrap_or(StripeEventType::Unknown)
    }

    /// Decode `data.object` into a typed Stripe object
    pub fn object<T: DeserializeOwned>(&self) -> StripeWebhookResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            StripeWebhookError::InvalidPayload(format!(
                "{} object does not match schema: {}",
                self.event_type, e
            ))
        })
    }

    /// Read a top-level string-or-object reference from `data.object`
    ///
    /// Returns `None` when the field is absent or JSON `null`.
    pub fn object_reference(&self, field: &str) -> Option<String> {
        reference_id(self.data.object.get(field)?)
    }
}

/// Event data container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// The actual event object (session, invoice, subscription, etc.)
    pub object: serde_json::Value,

    /// Previous values for updated fields (only in *.updated events)
    #[serde(default)]
    pub previous_attributes: Option<serde_json::Value>,
}

/// Extract an id from a JSON value that is either `"id"` or `{"id": ...}`
pub(crate) fn reference_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Object(map) => map
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Stripe metadata (string keys, string values)
pub type Metadata = HashMap<String, String>;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// =============================================================================
// Expandable references
// =============================================================================

/// A field that is an id by default and an object when expanded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    /// Bare id (`"pm_123"`)
    Id(String),
    /// Expanded object
    Object(Box<T>),
}

/// Objects that carry a Stripe id
pub trait StripeObject {
    /// The object's id
    fn object_id(&self) -> &str;
}

impl<T: StripeObject> Expandable<T> {
    /// The referenced id, whether or not the field was expanded
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object(obj) => obj.object_id(),
        }
    }

    /// The expanded object, if the field was expanded
    pub fn as_object(&self) -> Option<&T> {
        match self {
            Self::Id(_) => None,
            Self::Object(obj) => Some(obj.as_ref()),
        }
    }
}

/// Minimal reference used where only the id matters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Object id
    pub id: String,
}

impl StripeObject for ObjectRef {
    fn object_id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Checkout / payment objects
// =============================================================================

/// Stripe checkout session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Session ID (cs_...)
    pub id: String,
    /// `payment`, `subscription` or `setup`
    #[serde(default)]
    pub mode: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`
    #[serde(default)]
    pub payment_status: Option<String>,
    /// Customer reference
    #[serde(default)]
    pub customer: Option<Expandable<ObjectRef>>,
    /// Customer email entered at checkout
    #[serde(default)]
    pub customer_email: Option<String>,
    /// Subscription created by the session (subscription mode)
    #[serde(default)]
    pub subscription: Option<Expandable<ObjectRef>>,
    /// Payment intent created by the session (payment mode)
    #[serde(default)]
    pub payment_intent: Option<Expandable<ObjectRef>>,
    /// Total in the smallest currency unit
    #[serde(default)]
    pub amount_total: Option<i64>,
    /// Currency
    #[serde(default)]
    pub currency: Option<String>,
    /// Metadata set when the session was created
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

impl CheckoutSession {
    /// Whether this is a one-time payment session
    pub fn is_payment_mode(&self) -> bool {
        self.mode.as_deref() == Some("payment")
    }
}

/// Stripe payment intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Payment intent ID (pi_...)
    pub id: String,
    /// Payment intent status
    #[serde(default)]
    pub status: Option<String>,
    /// Amount in the smallest currency unit
    #[serde(default)]
    pub amount: Option<i64>,
    /// Currency
    #[serde(default)]
    pub currency: Option<String>,
    /// Metadata copied from the checkout session
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

impl StripeObject for PaymentIntent {
    fn object_id(&self) -> &str {
        &self.id
    }
}

/// Stripe charge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    /// Charge ID (ch_...)
    pub id: String,
    /// Payment intent the charge belongs to
    #[serde(default)]
    pub payment_intent: Option<Expandable<ObjectRef>>,
    /// Whether the charge has been fully refunded
    #[serde(default)]
    pub refunded: bool,
    /// Amount refunded so far
    #[serde(default)]
    pub amount_refunded: Option<i64>,
    /// Metadata copied from the payment intent
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

/// Checkout session line item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    /// Line item ID (li_...)
    pub id: String,
    /// Price purchased
    #[serde(default)]
    pub price: Option<Price>,
    /// Quantity purchased
    #[serde(default)]
    pub quantity: Option<u64>,
}

/// Paginated Stripe list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct List<T> {
    /// Items on this page
    pub data: Vec<T>,
    /// Whether more pages exist
    #[serde(default)]
    pub has_more: bool,
}

// =============================================================================
// Subscription Types
// =============================================================================

/// Stripe subscription object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription ID (sub_...)
    pub id: String,
    /// Customer reference
    pub customer: Expandable<ObjectRef>,
    /// Subscription status, verbatim
    pub status: String,
    /// Current billing period start (Unix timestamp)
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Current billing period end (Unix timestamp)
    #[serde(default)]
    pub current_period_end: Option<i64>,
    /// Whether subscription will cancel at period end
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Subscription items (plans/prices)
    pub items: List<SubscriptionItem>,
    /// Default payment method, expanded when requested
    #[serde(default)]
    pub default_payment_method: Option<Expandable<PaymentMethod>>,
    /// Metadata attached to the subscription
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

impl StripeObject for Subscription {
    fn object_id(&self) -> &str {
        &self.id
    }
}

impl Subscription {
    /// The first subscription item
    pub fn primary_item(&self) -> Option<&SubscriptionItem> {
        self.items.data.first()
    }

    /// Price of the first item
    pub fn primary_price(&self) -> Option<&Price> {
        self.primary_item().map(|item| &item.price)
    }

    /// Period start, from the subscription or (newer API versions) its item
    pub fn period_start(&self) -> Option<i64> {
        self.current_period_start
            .or_else(|| self.primary_item().and_then(|i| i.current_period_start))
    }

    /// Period end, from the subscription or (newer API versions) its item
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.primary_item().and_then(|i| i.current_period_end))
    }

    /// Card brand and last four digits, when the payment method was expanded
    pub fn card_details(&self) -> Option<(&str, &str)> {
        let card = self
            .default_payment_method
            .as_ref()?
            .as_object()?
            .card
            .as_ref()?;
        Some((card.brand.as_str(), card.last4.as_str()))
    }
}

/// Subscription status as Stripe reports it
///
/// The local mirror stores the status string verbatim; this is the typed
/// view the credit rules decide on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Paid and current; the only status that earns credits
    Active,
    /// Renewal payment failed, Stripe is retrying
    PastDue,
    /// Retries exhausted
    Unpaid,
    /// Ended
    Canceled,
    /// First payment not yet confirmed
    Incomplete,
    /// First payment never confirmed
    IncompleteExpired,
    /// In a free trial
    Trialing,
    /// Collection paused
    Paused,
    /// Anything else, including the local `"none"` sentinel
    #[serde(other)]
    Unknown,
}

impl From<&str> for SubscriptionStatus {
    fn from(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "trialing" => Self::Trialing,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }
}

/// Individual subscription item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    /// Item ID
    pub id: String,
    /// Price object
    pub price: Price,
    /// Quantity
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    /// Item-level period start (API versions from 2025 onwards)
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Item-level period end
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

fn default_quantity() -> u32 {
    1
}

/// Price object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    /// Price ID
    pub id: String,
    /// Product reference
    #[serde(default)]
    pub product: Option<Expandable<ObjectRef>>,
    /// Unit amount in cents
    #[serde(default)]
    pub unit_amount: Option<i64>,
    /// Currency
    #[serde(default)]
    pub currency: Option<String>,
    /// Recurring information
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

/// Recurring price details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recurring {
    /// Billing interval (day, week, month, year)
    pub interval: String,
    /// Number of intervals
    #[serde(default = "default_interval_count")]
    pub interval_count: u32,
}

fn default_interval_count() -> u32 {
    1
}

/// Stripe payment method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    /// Payment method ID (pm_...)
    pub id: String,
    /// Card details for card payment methods
    #[serde(default)]
    pub card: Option<CardDetails>,
}

impl StripeObject for PaymentMethod {
    fn object_id(&self) -> &str {
        &self.id
    }
}

/// Card brand and last four digits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardDetails {
    /// Card brand (visa, mastercard, ...)
    pub brand: String,
    /// Last four digits
    pub last4: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parsing() {
        assert_eq!(
            StripeEventType::from_str("customer.subscription.created").unwrap(),
            StripeEventType::SubscriptionCreated
        );
        assert_eq!(
            StripeEventType::from_str("invoice.payment_succeeded").unwrap(),
            StripeEventType::InvoicePaymentSucceeded
        );
        assert_eq!(
            StripeEventType::from_str("unknown.event").unwrap(),
            StripeEventType::Unknown
        );
    }

    #[test]
    fn test_event_type_string_forms_agree() {
        let all = [
            StripeEventType::CheckoutSessionCompleted,
            StripeEventType::PaymentIntentFailed,
            StripeEventType::ChargeRefunded,
            StripeEventType::SubscriptionPendingUpdateApplied,
            StripeEventType::InvoiceMarkedUncollectible,
            StripeEventType::InvoiceUpcoming,
        ];
        for ty in all {
            assert_eq!(StripeEventType::from_str(ty.as_str()).unwrap(), ty);
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn test_subscription_status_from_stripe_string() {
        assert_eq!(SubscriptionStatus::from("active"), SubscriptionStatus::Active);
        assert_eq!(SubscriptionStatus::from("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(
            SubscriptionStatus::from("incomplete_expired"),
            SubscriptionStatus::IncompleteExpired
        );
        assert_eq!(SubscriptionStatus::from("none"), SubscriptionStatus::Unknown);
        assert_eq!(SubscriptionStatus::from("ACTIVE"), SubscriptionStatus::Unknown);
    }

    #[test]
    fn test_parse_checkout_session() {
        let json = r#"{
            "id": "evt_cs_1",
            "type": "checkout.session.completed",
            "created": 1700000000,
            "livemode": false,
            "data": {
                "object": {
                    "id": "cs_test_1",
                    "mode": "payment",
                    "customer": null,
                    "payment_intent": "pi_1",
                    "subscription": null,
                    "metadata": {"purchaseId": "pur_1"}
                }
            }
        }"#;

        let event = StripeEvent::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(
            event.typed_event_type(),
            StripeEventType::CheckoutSessionCompleted
        );
        let session: CheckoutSession = event.object().unwrap();
        assert!(session.is_payment_mode());
        assert_eq!(session.payment_intent.unwrap().id(), "pi_1");
        assert_eq!(session.metadata.get("purchaseId").unwrap(), "pur_1");
        assert!(event.object_reference("subscription").is_none());
    }

    #[test]
    fn test_null_metadata_is_empty() {
        let intent: PaymentIntent =
            serde_json::from_str(r#"{"id": "pi_1", "metadata": null}"#).unwrap();
        assert!(intent.metadata.is_empty());
    }

    #[test]
    fn test_parse_subscription_with_expanded_payment_method() {
        let json = r#"{
            "id": "sub_1",
            "customer": {"id": "cus_1", "object": "customer"},
            "status": "active",
            "cancel_at_period_end": false,
            "items": {
                "data": [{
                    "id": "si_1",
                    "current_period_start": 1700000000,
                    "current_period_end": 1702592000,
                    "price": {
                        "id": "price_pro",
                        "product": "prod_1",
                        "unit_amount": 2000,
                        "currency": "usd",
                        "recurring": {"interval": "month", "interval_count": 1}
                    }
                }]
            },
            "default_payment_method": {
                "id": "pm_1",
                "card": {"brand": "visa", "last4": "4242"}
            }
        }"#;

        let sub: Subscription = serde_json::from_str(json).unwrap();
        assert_eq!(sub.customer.id(), "cus_1");
        assert_eq!(SubscriptionStatus::from(sub.status.as_str()), SubscriptionStatus::Active);
        assert_eq!(sub.primary_price().unwrap().id, "price_pro");
        assert_eq!(sub.period_start(), Some(1700000000));
        assert_eq!(sub.period_end(), Some(1702592000));
        assert_eq!(sub.card_details(), Some(("visa", "4242")));
    }

    #[test]
    fn test_unexpanded_payment_method_has_no_card() {
        let json = r#"{
            "id": "sub_1",
            "customer": "cus_1",
            "status": "past_due",
            "current_period_start": 1,
            "current_period_end": 2,
            "items": {"data": []},
            "default_payment_method": "pm_1"
        }"#;
        let sub: Subscription = serde_json::from_str(json).unwrap();
        assert!(sub.card_details().is_none());
        assert_eq!(sub.default_payment_method.as_ref().unwrap().id(), "pm_1");
        assert_eq!(sub.period_start(), Some(1));
    }

    #[test]
    fn test_object_reference_accepts_expanded_objects() {
        let event = StripeEvent::from_bytes(
            br#"{"id":"evt","type":"invoice.paid","created":1,"data":{"object":{"subscription":{"id":"sub_9"},"customer":"cus_9"}}}"#,
        )
        .unwrap();
        assert_eq!(event.object_reference("subscription").as_deref(), Some("sub_9"));
        assert_eq!(event.object_reference("customer").as_deref(), Some("cus_9"));
        assert!(event.object_reference("missing").is_none());
    }
}
