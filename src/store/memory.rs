//! In-memory billing store
//!
//! A transaction locks the store, works on a copy of the state and swaps the
//! copy in only when the closure succeeds. Used by tests and dry runs.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    NewPurchase, NewUser, Purchase, PurchaseStatus, PurchaseUpdate, SubscriptionRecord, User,
};
use crate::store::{gen_id, now, BillingStore, StoreTx};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: HashMap<String, User>,
    purchases: HashMap<String, Purchase>,
    subscriptions: HashMap<String, SubscriptionRecord>,
}

/// Mutex-guarded in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored purchases
    pub fn purchase_count(&self) -> usize {
        self.state.lock().purchases.len()
    }
}

impl BillingStore for MemoryStore {
    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> StoreResult<T>,
    {
        let mut guard = self.state.lock();
        let mut tx = MemoryTx {
            state: guard.clone(),
        };
        let out = f(&mut tx)?;
        *guard = tx.state;
        Ok(out)
    }
}

struct MemoryTx {
    state: MemoryState,
}

impl StoreTx for MemoryTx {
    fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        Ok(self.state.users.get(user_id).cloned())
    }

    fn find_user_by_customer(&self, customer_id: &str) -> StoreResult<Option<User>> {
        Ok(self
            .state
            .users
            .values()
            .find(|u| u.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    fn create_user(&mut self, input: &NewUser) -> StoreResult<User> {
        let user = User {
            id: input.id.clone().unwrap_or_else(|| gen_id("user")),
            email: input.email.clone(),
            stripe_customer_id: input.stripe_customer_id.clone(),
            credits: input.credits,
        };
        self.state.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    fn find_purchase(&self, purchase_id: &str) -> StoreResult<Option<Purchase>> {
        Ok(self.state.purchases.get(purchase_id).cloned())
    }

    fn list_purchases_for_user(&self, user_id: &str) -> StoreResult<Vec<Purchase>> {
        let mut purchases: Vec<Purchase> = self
            .state
            .purchases
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        purchases.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(purchases)
    }

    fn create_purchase(&mut self, input: &NewPurchase) -> StoreResult<Purchase> {
        if !self.state.users.contains_key(&input.user_id) {
            return Err(StoreError::not_found("user", &input.user_id));
        }
        let ts = now();
        let purchase = Purchase {
            id: input.id.clone().unwrap_or_else(|| gen_id("pur")),
            user_id: input.user_id.clone(),
            product_id: input.product_id.clone(),
            amount: input.amount,
            currency: input.currency.clone(),
            status: PurchaseStatus::Pending,
            stripe_payment_intent_id: None,
            stripe_checkout_session_id: input.stripe_checkout_session_id.clone(),
            completed_at: None,
            credits_granted: 0,
            metadata: input.metadata.clone(),
            created_at: ts,
            updated_at: ts,
        };
        self.state
            .purchases
            .insert(purchase.id.clone(), purchase.clone());
        Ok(purchase)
    }

    fn update_purchase(
        &mut self,
        purchase_id: &str,
        update: &PurchaseUpdate,
    ) -> StoreResult<Purchase> {
        let purchase = self
            .state
            .purchases
            .get_mut(purchase_id)
            .ok_or_else(|| StoreError::not_found("purchase", purchase_id))?;
        purchase.status = update.status;
        if let Some(pi) = &update.stripe_payment_intent_id {
            purchase.stripe_payment_intent_id = Some(pi.clone());
        }
        if let Some(cs) = &update.stripe_checkout_session_id {
            purchase.stripe_checkout_session_id = Some(cs.clone());
        }
        if let Some(ts) = update.completed_at {
            purchase.completed_at = Some(ts);
        }
        if let Some(credits) = update.credits_granted {
            purchase.credits_granted = credits;
        }
        purchase.updated_at = now();
        Ok(purchase.clone())
    }

    fn find_subscription(&self, user_id: &str) -> StoreResult<Option<SubscriptionRecord>> {
        Ok(self.state.subscriptions.get(user_id).cloned())
    }

    fn upsert_subscription(&mut self, record: &SubscriptionRecord) -> StoreResult<()> {
        if !self.state.users.contains_key(&record.user_id) {
            return Err(StoreError::not_found("user", &record.user_id));
        }
        self.state
            .subscriptions
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    fn adjust_credits(&mut self, user_id: &str, delta: i64) -> StoreResult<i64> {
        let user = self
            .state
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::not_found("user", user_id))?;
        user.credits += delta;
        Ok(user.credits)
    }
}
