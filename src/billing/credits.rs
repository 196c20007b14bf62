//! Price catalog and credit decisions
//!
//! The decision functions are pure; [`apply_credit_change`] is the only code
//! that writes a balance, and it always runs on the same [`StoreTx`] as the
//! purchase or subscription write that justifies it.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, StoreResult};
use crate::models::{PurchaseStatus, SubscriptionRecord};
use crate::store::StoreTx;
use crate::stripe::events::{StripeEventType, SubscriptionStatus};

/// Credits (and optional fulfillment) attached to one price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEntry {
    /// Credits granted per purchase or billing period
    pub credits: i64,
    /// Post-purchase fulfillment tag passed to the notifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<String>,
}

/// Static price → credits table
///
/// One-time and subscription prices are kept apart; a price missing from
/// the relevant table is worth zero credits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceCatalog {
    /// One-time purchase prices
    #[serde(default)]
    pub one_time: HashMap<String, PriceEntry>,
    /// Recurring subscription prices
    #[serde(default)]
    pub subscription: HashMap<String, PriceEntry>,
}

impl PriceCatalog {
    /// Parse a catalog from JSON
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let catalog: Self = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&json)?;
        tracing::info!(
            path = %path.display(),
            one_time = catalog.one_time.len(),
            subscription = catalog.subscription.len(),
            "Loaded price catalog"
        );
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), Error> {
        let negative = self
            .one_time
            .iter()
            .chain(self.subscription.iter())
            .find(|(_, entry)| entry.credits < 0);
        match negative {
            Some((price, entry)) => Err(Error::Config(format!(
                "price {price} has negative credits ({})",
                entry.credits
            ))),
            None => Ok(()),
        }
    }

    /// Add a one-time price
    pub fn with_one_time(mut self, price_id: &str, credits: i64) -> Self {
        self.one_time.insert(
            price_id.to_string(),
            PriceEntry {
                credits,
                fulfillment: None,
            },
        );
        self
    }

    /// Add a one-time price with a fulfillment tag
    pub fn with_fulfillment(mut self, price_id: &str, credits: i64, fulfillment: &str) -> Self {
        self.one_time.insert(
            price_id.to_string(),
            PriceEntry {
                credits,
                fulfillment: Some(fulfillment.to_string()),
            },
        );
        self
    }

    /// Add a subscription price
    pub fn with_subscription(mut self, price_id: &str, credits: i64) -> Self {
        self.subscription.insert(
            price_id.to_string(),
            PriceEntry {
                credits,
                fulfillment: None,
            },
        );
        self
    }

    /// Credits for a one-time price (0 if unmapped)
    pub fn one_time_credits(&self, price_id: &str) -> i64 {
        self.one_time.get(price_id).map_or(0, |e| e.credits)
    }

    /// Credits for a subscription price (0 if unmapped or absent)
    pub fn subscription_credits(&self, price_id: Option<&str>) -> i64 {
        price_id
            .and_then(|id| self.subscription.get(id))
            .map_or(0, |e| e.credits)
    }

    /// Fulfillment tag of a one-time price
    pub fn fulfillment(&self, price_id: &str) -> Option<&str> {
        self.one_time
            .get(price_id)
            .and_then(|e| e.fulfillment.as_deref())
    }
}

/// Balance change for a purchase moving from `prior` to `target`
///
/// For a completion `credits` is what the bought price is worth, granted
/// unless the purchase was already completed. For a refund it is the amount
/// recorded at completion, revoked only if the purchase had been completed.
pub fn purchase_credit_change(prior: PurchaseStatus, target: PurchaseStatus, credits: i64) -> i64 {
    if credits <= 0 {
        return 0;
    }
    match (prior, target) {
        (PurchaseStatus::Completed, PurchaseStatus::Completed) => 0,
        (_, PurchaseStatus::Completed) => credits,
        (PurchaseStatus::Completed, PurchaseStatus::Refunded) => -credits,
        _ => 0,
    }
}

/// Which subscription rule produced a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantReason {
    /// First active subscription
    Activation,
    /// Price changed on an active subscription
    PlanChange,
    /// Paid invoice for an unchanged price in a new period
    Renewal,
}

impl fmt::Display for GrantReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Activation => "activation",
            Self::PlanChange => "plan_change",
            Self::Renewal => "renewal",
        })
    }
}

/// Result of the subscription credit decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditGrant {
    /// Rule that fired
    pub reason: GrantReason,
    /// Credits to add; never negative
    pub amount: i64,
}

/// Decide the credit grant for a subscription sync
///
/// `prior` is the stored row before the sync (a cleared `"none"` row counts
/// as absent), `next` the freshly fetched state. At most one rule fires, in
/// this order:
///
/// 1. no prior subscription and `next` is active: full credits
/// 2. price changed and `next` is active: `max(0, new - old)`
/// 3. `invoice.payment_succeeded`, active, same price, and the period has
///    not been credited yet: full credits
pub fn subscription_credit_grant(
    prior: Option<&SubscriptionRecord>,
    next: &SubscriptionRecord,
    trigger: StripeEventType,
    catalog: &PriceCatalog,
) -> Option<CreditGrant> {
    if SubscriptionStatus::from(next.status.as_str()) != SubscriptionStatus::Active {
        return None;
    }

    let new_credits = catalog.subscription_credits(next.stripe_price_id.as_deref());
    let prior = prior.filter(|p| p.is_present());

    let Some(prior) = prior else {
        return Some(CreditGrant {
            reason: GrantReason::Activation,
            amount: new_credits,
        });
    };

    if prior.stripe_price_id != next.stripe_price_id {
        let old_credits = catalog.subscription_credits(prior.stripe_price_id.as_deref());
        return Some(CreditGrant {
            reason: GrantReason::PlanChange,
            amount: (new_credits - old_credits).max(0),
        });
    }

    if trigger == StripeEventType::InvoicePaymentSucceeded
        && prior.credited_period_start != next.current_period_start
    {
        return Some(CreditGrant {
            reason: GrantReason::Renewal,
            amount: new_credits,
        });
    }

    None
}

/// What a balance change is for
#[derive(Debug, Clone, Copy)]
pub enum CreditCause<'a> {
    /// Purchase reached COMPLETED
    PurchaseCompleted(&'a str),
    /// Completed purchase was refunded
    PurchaseRefunded(&'a str),
    /// Subscription grant
    Subscription(GrantReason, &'a str),
}

impl fmt::Display for CreditCause<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PurchaseCompleted(id) => write!(f, "purchase {id} completed"),
            Self::PurchaseRefunded(id) => write!(f, "purchase {id} refunded"),
            Self::Subscription(reason, id) => write!(f, "subscription {id} {reason}"),
        }
    }
}

/// Apply `delta` to a user's balance inside `tx`
///
/// Returns the new balance, or `None` when `delta` is zero and nothing was
/// written.
pub fn apply_credit_change(
    tx: &mut dyn StoreTx,
    user_id: &str,
    delta: i64,
    cause: CreditCause<'_>,
) -> StoreResult<Option<i64>> {
    if delta == 0 {
        return Ok(None);
    }
    let balance = tx.adjust_credits(user_id, delta)?;
    tracing::info!(
        user_id,
        credit_delta = delta,
        balance,
        cause = %cause,
        "Credit balance adjusted"
    );
    Ok(Some(balance))
}
