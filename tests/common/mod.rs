//! Shared fixtures for the integration tests: a scripted payment provider,
//! a recording notifier and event builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Barrier;

use creditsync::billing::{Notifier, PriceCatalog, PurchaseNotice, Reconciler};
use creditsync::error::ProviderError;
use creditsync::models::{NewPurchase, NewUser};
use creditsync::store::{BillingStore, MemoryStore};
use creditsync::stripe::client::PaymentProvider;
use creditsync::stripe::events::{LineItem, PaymentIntent, StripeEvent, Subscription};

pub const USER_ID: &str = "user_1";
pub const CUSTOMER_ID: &str = "cus_1";
pub const PURCHASE_ID: &str = "pur_1";
pub const SESSION_ID: &str = "cs_1";
pub const INTENT_ID: &str = "pi_1";

pub const PACK_PRICE: &str = "price_pack_100";
pub const REPO_PRICE: &str = "price_repo";
pub const BASIC_PRICE: &str = "price_basic";
pub const PRO_PRICE: &str = "price_pro";

pub const PERIOD_1: i64 = 1_700_000_000;
pub const PERIOD_2: i64 = PERIOD_1 + 30 * 86_400;

/// Payment provider answering from canned responses
#[derive(Default)]
pub struct MockProvider {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    line_items: Mutex<HashMap<String, Vec<LineItem>>>,
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    failures_left: Mutex<u32>,
    calls: Mutex<Vec<String>>,
    line_item_gate: Mutex<Option<Arc<Barrier>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intent(self, id: &str, metadata: Value) -> Self {
        let intent: PaymentIntent =
            serde_json::from_value(json!({ "id": id, "metadata": metadata })).unwrap();
        self.intents.lock().insert(id.to_string(), intent);
        self
    }

    pub fn with_line_item(self, session_id: &str, price_id: &str) -> Self {
        let item: LineItem = serde_json::from_value(json!({
            "id": format!("li_{price_id}"),
            "price": { "id": price_id },
            "quantity": 1
        }))
        .unwrap();
        self.line_items
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(item);
        self
    }

    /// Replace what Stripe reports for `customer_id`
    pub fn set_subscriptions(&self, customer_id: &str, subscriptions: Vec<Subscription>) {
        self.subscriptions
            .lock()
            .insert(customer_id.to_string(), subscriptions);
    }

    /// Hold every line-item call until `parties` of them are waiting
    pub fn gate_line_items(self, parties: usize) -> Self {
        *self.line_item_gate.lock() = Some(Arc::new(Barrier::new(parties)));
        self
    }

    /// Fail the next `count` calls with a 500
    pub fn fail_next(&self, count: u32) {
        *self.failures_left.lock() = count;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn enter(&self, call: String) -> Result<(), ProviderError> {
        self.calls.lock().push(call);
        let mut left = self.failures_left.lock();
        if *left > 0 {
            *left -= 1;
            return Err(ProviderError::Api {
                status: 500,
                message: "scripted outage".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError> {
        self.enter(format!("retrieve_payment_intent:{id}"))?;
        self.intents
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                message: format!("No such payment_intent: {id}"),
            })
    }

    async fn list_line_items(&self, session_id: &str) -> Result<Vec<LineItem>, ProviderError> {
        self.enter(format!("list_line_items:{session_id}"))?;
        let gate = self.line_item_gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        Ok(self
            .line_items
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
        limit: u32,
    ) -> Result<Vec<Subscription>, ProviderError> {
        self.enter(format!("list_subscriptions:{customer_id}"))?;
        Ok(self
            .subscriptions
            .lock()
            .get(customer_id)
            .map(|subs| subs.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }
}

/// Notifier that remembers every notice
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<PurchaseNotice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<PurchaseNotice> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn purchase_completed(&self, notice: &PurchaseNotice) -> anyhow::Result<()> {
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}

pub type TestReconciler = Reconciler<MemoryStore, MockProvider, RecordingNotifier>;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MockProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub reconciler: Arc<TestReconciler>,
}

impl Harness {
    pub fn new(provider: MockProvider) -> Self {
        let store = Arc::new(seeded_store());
        let provider = Arc::new(provider);
        let notifier = Arc::new(RecordingNotifier::default());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            Arc::clone(&notifier),
            catalog(),
        ));
        Self {
            store,
            provider,
            notifier,
            reconciler,
        }
    }

    pub fn credits(&self) -> i64 {
        self.store.find_user(USER_ID).unwrap().unwrap().credits
    }
}

pub fn catalog() -> PriceCatalog {
    PriceCatalog::default()
        .with_one_time(PACK_PRICE, 100)
        .with_fulfillment(REPO_PRICE, 0, "repository_access")
        .with_subscription(BASIC_PRICE, 10)
        .with_subscription(PRO_PRICE, 50)
}

/// A user with a Stripe customer and one PENDING purchase of the 100-credit pack
pub fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    seed(&store);
    store
}

pub fn seed<S: BillingStore>(store: &S) {
    store
        .create_user(&NewUser {
            id: Some(USER_ID.into()),
            email: Some("buyer@example.com".into()),
            stripe_customer_id: Some(CUSTOMER_ID.into()),
            credits: 0,
        })
        .unwrap();
    store
        .create_purchase(&NewPurchase {
            id: Some(PURCHASE_ID.into()),
            user_id: USER_ID.into(),
            product_id: PACK_PRICE.into(),
            amount: 999,
            currency: "usd".into(),
            stripe_checkout_session_id: Some(SESSION_ID.into()),
            metadata: json!({}),
        })
        .unwrap();
}

/// Provider set up for a checkout of the 100-credit pack
pub fn pack_checkout_provider() -> MockProvider {
    MockProvider::new()
        .with_intent(INTENT_ID, json!({ "purchaseId": PURCHASE_ID }))
        .with_line_item(SESSION_ID, PACK_PRICE)
}

pub fn event(id: &str, event_type: &str, object: Value) -> StripeEvent {
    serde_json::from_value(json!({
        "id": id,
        "type": event_type,
        "created": PERIOD_1,
        "data": { "object": object }
    }))
    .unwrap()
}

pub fn checkout_completed(id: &str) -> StripeEvent {
    event(
        id,
        "checkout.session.completed",
        json!({
            "id": SESSION_ID,
            "mode": "payment",
            "payment_status": "paid",
            "payment_intent": INTENT_ID,
            "customer": CUSTOMER_ID,
            "metadata": { "purchaseId": PURCHASE_ID }
        }),
    )
}

pub fn charge_refunded(id: &str) -> StripeEvent {
    event(
        id,
        "charge.refunded",
        json!({
            "id": "ch_1",
            "payment_intent": INTENT_ID,
            "refunded": true,
            "metadata": { "purchaseId": PURCHASE_ID }
        }),
    )
}

pub fn payment_failed(id: &str, purchase_id: &str) -> StripeEvent {
    event(
        id,
        "payment_intent.payment_failed",
        json!({
            "id": INTENT_ID,
            "status": "requires_payment_method",
            "metadata": { "purchaseId": purchase_id }
        }),
    )
}

pub fn subscription(id: &str, status: &str, price_id: &str, period_start: i64) -> Subscription {
    serde_json::from_value(json!({
        "id": id,
        "customer": CUSTOMER_ID,
        "status": status,
        "cancel_at_period_end": false,
        "current_period_start": period_start,
        "current_period_end": period_start + 30 * 86_400,
        "items": { "data": [{
            "id": "si_1",
            "price": { "id": price_id, "recurring": { "interval": "month" } }
        }]},
        "default_payment_method": {
            "id": "pm_1",
            "card": { "brand": "visa", "last4": "4242" }
        }
    }))
    .unwrap()
}

pub fn subscription_event(id: &str, event_type: &str) -> StripeEvent {
    event(
        id,
        event_type,
        json!({ "id": "sub_1", "object": "subscription", "customer": CUSTOMER_ID, "status": "active" }),
    )
}

pub fn invoice_event(id: &str, event_type: &str, subscription_id: Option<&str>) -> StripeEvent {
    event(
        id,
        event_type,
        json!({
            "id": "in_1",
            "object": "invoice",
            "customer": CUSTOMER_ID,
            "subscription": subscription_id,
            "billing_reason": "subscription_cycle"
        }),
    )
}
