//! Persistent billing records
//!
//! These mirror the rows kept by the data store. Purchases and subscriptions
//! are never physically deleted; a cleared subscription keeps its row with
//! status [`SUBSCRIPTION_STATUS_NONE`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Local status recorded when the provider reports no subscription
pub const SUBSCRIPTION_STATUS_NONE: &str = "none";

/// Purchase lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseStatus {
    /// Created at checkout, awaiting a payment outcome
    Pending,
    /// Paid; credits granted
    Completed,
    /// Payment failed
    Failed,
    /// Paid, then refunded; credits revoked
    Refunded,
}

impl PurchaseStatus {
    /// Get the stored string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }

    /// Whether a reconciler may move a purchase from `self` to `target`
    ///
    /// Statuses only move forward: PENDING may become anything, a FAILED
    /// payment may still be completed by a later attempt, COMPLETED may only
    /// be refunded, and REFUNDED is final. Re-applying the current status is
    /// allowed except for COMPLETED, which is the duplicate-delivery case.
    pub fn can_transition_to(&self, target: PurchaseStatus) -> bool {
        use PurchaseStatus::*;
        match (self, target) {
            (Pending, _) => true,
            (Failed, Completed | Failed) => true,
            (Completed, Refunded) => true,
            (Refunded, Refunded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurchaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "REFUNDED" => Ok(Self::Refunded),
            other => Err(format!("unknown purchase status: {other}")),
        }
    }
}

/// Account owning purchases, a subscription and a credit balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub id: String,
    /// Email address, used for notifications
    pub email: Option<String>,
    /// Stripe customer reference (cus_...)
    pub stripe_customer_id: Option<String>,
    /// Prepaid usage balance
    pub credits: i64,
}

/// Input for creating a user
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    /// Explicit id; generated when absent
    pub id: Option<String>,
    /// Email address
    pub email: Option<String>,
    /// Stripe customer reference
    pub stripe_customer_id: Option<String>,
    /// Opening balance
    pub credits: i64,
}

/// One-time purchase record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    /// Purchase ID, created before checkout
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// Product (Stripe price) identifier
    pub product_id: String,
    /// Amount in the smallest currency unit
    pub amount: i64,
    /// ISO currency code
    pub currency: String,
    /// Lifecycle status
    pub status: PurchaseStatus,
    /// Stripe payment intent reference (pi_...)
    pub stripe_payment_intent_id: Option<String>,
    /// Stripe checkout session reference (cs_...)
    pub stripe_checkout_session_id: Option<String>,
    /// When the purchase completed (Unix timestamp)
    pub completed_at: Option<i64>,
    /// Credits added to the buyer's balance on completion; a refund revokes
    /// exactly this amount
    pub credits_granted: i64,
    /// Free-form metadata
    pub metadata: serde_json::Value,
    /// Creation time (Unix timestamp)
    pub created_at: i64,
    /// Last update time (Unix timestamp)
    pub updated_at: i64,
}

/// Input for creating a purchase (done at checkout-session creation)
#[derive(Debug, Clone)]
pub struct NewPurchase {
    /// Explicit id; generated when absent
    pub id: Option<String>,
    /// Owning user
    pub user_id: String,
    /// Product (Stripe price) identifier
    pub product_id: String,
    /// Amount in the smallest currency unit
    pub amount: i64,
    /// ISO currency code
    pub currency: String,
    /// Checkout session reference, when already known
    pub stripe_checkout_session_id: Option<String>,
    /// Free-form metadata
    pub metadata: serde_json::Value,
}

/// Fields a reconciler writes on a purchase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseUpdate {
    /// New status
    pub status: PurchaseStatus,
    /// Payment intent reference, kept unchanged when `None`
    pub stripe_payment_intent_id: Option<String>,
    /// Checkout session reference, kept unchanged when `None`
    pub stripe_checkout_session_id: Option<String>,
    /// Completion time, kept unchanged when `None`
    pub completed_at: Option<i64>,
    /// Credits granted, kept unchanged when `None`
    pub credits_granted: Option<i64>,
}

impl PurchaseUpdate {
    /// A status change that leaves every other field as stored
    pub fn status(status: PurchaseStatus) -> Self {
        Self {
            status,
            stripe_payment_intent_id: None,
            stripe_checkout_session_id: None,
            completed_at: None,
            credits_granted: None,
        }
    }
}

/// Local mirror of a user's Stripe subscription (one per user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Owning user (primary key)
    pub user_id: String,
    /// Stripe customer reference
    pub stripe_customer_id: String,
    /// Stripe subscription reference
    pub stripe_subscription_id: Option<String>,
    /// Stripe price reference
    pub stripe_price_id: Option<String>,
    /// Billing interval (month, year, ...)
    pub interval: Option<String>,
    /// Provider status verbatim, or `"none"`
    pub status: String,
    /// Current period start (Unix timestamp)
    pub current_period_start: Option<i64>,
    /// Current period end (Unix timestamp)
    pub current_period_end: Option<i64>,
    /// Whether the subscription cancels at period end
    pub cancel_at_period_end: bool,
    /// Card brand of the default payment method
    pub payment_method_brand: Option<String>,
    /// Card last four digits of the default payment method
    pub payment_method_last4: Option<String>,
    /// Period start of the last credit grant, local bookkeeping only
    pub credited_period_start: Option<i64>,
    /// Last sync time (Unix timestamp)
    pub updated_at: i64,
}

impl SubscriptionRecord {
    /// Whether the record represents a live subscription rather than the
    /// cleared sentinel
    pub fn is_present(&self) -> bool {
        self.status != SUBSCRIPTION_STATUS_NONE
    }

    /// A cleared record for `user_id`
    pub fn none(user_id: &str, customer_id: &str, now: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            stripe_customer_id: customer_id.to_string(),
            stripe_subscription_id: None,
            stripe_price_id: None,
            interval: None,
            status: SUBSCRIPTION_STATUS_NONE.to_string(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            payment_method_brand: None,
            payment_method_last4: None,
            credited_period_start: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PurchaseStatus::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [Pending, Completed, Failed, Refunded] {
            assert_eq!(status.as_str().parse::<PurchaseStatus>().unwrap(), status);
        }
        assert!("paid".parse::<PurchaseStatus>().is_err());
    }

    #[test]
    fn test_transition_table() {
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Refunded));

        assert!(Failed.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Refunded));

        assert!(!Completed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Refunded));

        assert!(!Refunded.can_transition_to(Completed));
        assert!(!Refunded.can_transition_to(Failed));
        assert!(Refunded.can_transition_to(Refunded));
    }

    #[test]
    fn test_none_record() {
        let record = SubscriptionRecord::none("user_1", "cus_1", 42);
        assert!(!record.is_present());
        assert_eq!(record.status, "none");
        assert_eq!(record.updated_at, 42);
    }
}
