//! Billing data store
//!
//! The reconcilers never hold a connection themselves. They read what they
//! need, then hand a closure to [`BillingStore::transaction`]; every write
//! inside that closure (status change, subscription overwrite, credit
//! adjustment) commits together or not at all.
//!
//! ```text
//! reconciler ──▶ BillingStore::transaction(|tx| {
//!                    tx.find_purchase(..)     // re-read under the lock
//!                    tx.update_purchase(..)
//!                    tx.adjust_credits(..)
//!                })  ──▶ commit | rollback
//! ```

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreResult;
use crate::models::{
    NewPurchase, NewUser, Purchase, PurchaseUpdate, SubscriptionRecord, User,
};

/// Operations available inside a store transaction
pub trait StoreTx {
    /// Find a user by id
    fn find_user(&self, user_id: &str) -> StoreResult<Option<User>>;

    /// Find a user by Stripe customer reference
    fn find_user_by_customer(&self, customer_id: &str) -> StoreResult<Option<User>>;

    /// Create a user
    fn create_user(&mut self, input: &NewUser) -> StoreResult<User>;

    /// Find a purchase by id
    fn find_purchase(&self, purchase_id: &str) -> StoreResult<Option<Purchase>>;

    /// List a user's purchases, newest first
    fn list_purchases_for_user(&self, user_id: &str) -> StoreResult<Vec<Purchase>>;

    /// Create a PENDING purchase
    fn create_purchase(&mut self, input: &NewPurchase) -> StoreResult<Purchase>;

    /// Write reconciled fields on a purchase
    fn update_purchase(&mut self, purchase_id: &str, update: &PurchaseUpdate)
        -> StoreResult<Purchase>;

    /// Find the subscription mirror for a user
    fn find_subscription(&self, user_id: &str) -> StoreResult<Option<SubscriptionRecord>>;

    /// Insert or fully overwrite the subscription mirror for `record.user_id`
    fn upsert_subscription(&mut self, record: &SubscriptionRecord) -> StoreResult<()>;

    /// Add `delta` (possibly negative) to a user's balance, returning the new balance
    fn adjust_credits(&mut self, user_id: &str, delta: i64) -> StoreResult<i64>;
}

/// A store that can run [`StoreTx`] closures atomically
pub trait BillingStore: Send + Sync + 'static {
    /// Run `f` in one transaction; commit on `Ok`, roll back on `Err`
    ///
    /// Transactions on the same store are serialized, so a read made inside
    /// `f` cannot be invalidated by a concurrent writer before `f` returns.
    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> StoreResult<T>;

    /// Find a user by Stripe customer reference
    fn find_user_by_customer(&self, customer_id: &str) -> StoreResult<Option<User>> {
        self.transaction(|tx| tx.find_user_by_customer(customer_id))
    }

    /// Find a user by id
    fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        self.transaction(|tx| tx.find_user(user_id))
    }

    /// Create a user
    fn create_user(&self, input: &NewUser) -> StoreResult<User> {
        self.transaction(|tx| tx.create_user(input))
    }

    /// Find a purchase by id
    fn find_purchase(&self, purchase_id: &str) -> StoreResult<Option<Purchase>> {
        self.transaction(|tx| tx.find_purchase(purchase_id))
    }

    /// Create a PENDING purchase
    fn create_purchase(&self, input: &NewPurchase) -> StoreResult<Purchase> {
        self.transaction(|tx| tx.create_purchase(input))
    }

    /// List a user's purchases, newest first
    fn list_purchases_for_user(&self, user_id: &str) -> StoreResult<Vec<Purchase>> {
        self.transaction(|tx| tx.list_purchases_for_user(user_id))
    }

    /// Find the subscription mirror for a user
    fn find_subscription(&self, user_id: &str) -> StoreResult<Option<SubscriptionRecord>> {
        self.transaction(|tx| tx.find_subscription(user_id))
    }
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn gen_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
