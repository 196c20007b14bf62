//! SQLite billing store
//!
//! Connections come from an r2d2 pool. Every reconciliation transaction is
//! opened `IMMEDIATE`, which takes the write lock up front: two deliveries of
//! the same event cannot both read "not yet completed" and both grant credits.

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::error::{StoreError, StoreResult};
use crate::models::{
    NewPurchase, NewUser, Purchase, PurchaseStatus, PurchaseUpdate, SubscriptionRecord, User,
};
use crate::store::{gen_id, now, BillingStore, StoreTx};

/// Pooled SQLite connections
pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA_VERSION: i32 = 2;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT,
    stripe_customer_id TEXT UNIQUE,
    credits INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS purchases (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    product_id TEXT NOT NULL,
    amount INTEGER NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    stripe_payment_intent_id TEXT,
    stripe_checkout_session_id TEXT,
    completed_at INTEGER,
    credits_granted INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT 'null',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_purchases_user ON purchases(user_id);

CREATE TABLE IF NOT EXISTS subscriptions (
    user_id TEXT PRIMARY KEY REFERENCES users(id),
    stripe_customer_id TEXT NOT NULL,
    stripe_subscription_id TEXT,
    stripe_price_id TEXT,
    interval TEXT,
    status TEXT NOT NULL,
    current_period_start INTEGER,
    current_period_end INTEGER,
    cancel_at_period_end INTEGER NOT NULL DEFAULT 0,
    payment_method_brand TEXT,
    payment_method_last4 TEXT,
    credited_period_start INTEGER,
    updated_at INTEGER NOT NULL
);
"#;

const USER_COLS: &str = "id, email, stripe_customer_id, credits";

const PURCHASE_COLS: &str = "id, user_id, product_id, amount, currency, status, \
    stripe_payment_intent_id, stripe_checkout_session_id, completed_at, metadata, \
    created_at, updated_at, credits_granted";

const SUBSCRIPTION_COLS: &str = "user_id, stripe_customer_id, stripe_subscription_id, \
    stripe_price_id, interval, status, current_period_start, current_period_end, \
    cancel_at_period_end, payment_method_brand, payment_method_last4, \
    credited_period_start, updated_at";

/// Create the schema if missing, migrate older databases and record the
/// version
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let has_purchases: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'purchases'",
        [],
        |row| row.get(0),
    )?;

    // Version 1 did not record what a completion granted
    if has_purchases && version < 2 {
        conn.execute_batch(
            "ALTER TABLE purchases ADD COLUMN credits_granted INTEGER NOT NULL DEFAULT 0;",
        )?;
        tracing::info!(from = version, to = SCHEMA_VERSION, "Migrated purchases table");
    }

    conn.execute_batch(SCHEMA)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// SQLite-backed [`BillingStore`]
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open (or create) a database file and initialize the schema
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder().max_size(10).build(manager)?;
        Self::from_pool(pool)
    }

    /// Single-connection in-memory database, for tests
    pub fn open_in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::from_pool(pool)
    }

    /// Wrap an existing pool, initializing the schema
    pub fn from_pool(pool: DbPool) -> StoreResult<Self> {
        let conn = pool.get()?;
        init_db(&conn)?;
        drop(conn);
        Ok(Self { pool })
    }
}

impl BillingStore for SqliteStore {
    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> StoreResult<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = {
            let mut handle = SqliteTx { conn: &tx };
            f(&mut handle)?
        };
        tx.commit()?;
        Ok(out)
    }
}

struct SqliteTx<'c> {
    conn: &'c Connection,
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        stripe_customer_id: row.get(2)?,
        credits: row.get(3)?,
    })
}

fn purchase_from_row(row: &Row<'_>) -> rusqlite::Result<Purchase> {
    let status: String = row.get(5)?;
    let status = status
        .parse::<PurchaseStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;
    let metadata: String = row.get(9)?;
    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

    Ok(Purchase {
        id: row.get(0)?,
        user_id: row.get(1)?,
        product_id: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        status,
        stripe_payment_intent_id: row.get(6)?,
        stripe_checkout_session_id: row.get(7)?,
        completed_at: row.get(8)?,
        credits_granted: row.get(12)?,
        metadata,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<SubscriptionRecord> {
    Ok(SubscriptionRecord {
        user_id: row.get(0)?,
        stripe_customer_id: row.get(1)?,
        stripe_subscription_id: row.get(2)?,
        stripe_price_id: row.get(3)?,
        interval: row.get(4)?,
        status: row.get(5)?,
        current_period_start: row.get(6)?,
        current_period_end: row.get(7)?,
        cancel_at_period_end: row.get(8)?,
        payment_method_brand: row.get(9)?,
        payment_method_last4: row.get(10)?,
        credited_period_start: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl StoreTx for SqliteTx<'_> {
    fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                params![user_id],
                user_from_row,
            )
            .optional()?)
    }

    fn find_user_by_customer(&self, customer_id: &str) -> StoreResult<Option<User>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE stripe_customer_id = ?1"),
                params![customer_id],
                user_from_row,
            )
            .optional()?)
    }

    fn create_user(&mut self, input: &NewUser) -> StoreResult<User> {
        let id = input.id.clone().unwrap_or_else(|| gen_id("user"));
        self.conn.execute(
            "INSERT INTO users (id, email, stripe_customer_id, credits) VALUES (?1, ?2, ?3, ?4)",
            params![id, input.email, input.stripe_customer_id, input.credits],
        )?;
        self.find_user(&id)?
            .ok_or_else(|| StoreError::not_found("user", id))
    }

    fn find_purchase(&self, purchase_id: &str) -> StoreResult<Option<Purchase>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {PURCHASE_COLS} FROM purchases WHERE id = ?1"),
                params![purchase_id],
                purchase_from_row,
            )
            .optional()?)
    }

    fn list_purchases_for_user(&self, user_id: &str) -> StoreResult<Vec<Purchase>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PURCHASE_COLS} FROM purchases WHERE user_id = ?1 \
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map(params![user_id], purchase_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn create_purchase(&mut self, input: &NewPurchase) -> StoreResult<Purchase> {
        if self.find_user(&input.user_id)?.is_none() {
            return Err(StoreError::not_found("user", &input.user_id));
        }
        let id = input.id.clone().unwrap_or_else(|| gen_id("pur"));
        let ts = now();
        let metadata = serde_json::to_string(&input.metadata)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO purchases (id, user_id, product_id, amount, currency, status, \
             stripe_checkout_session_id, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                input.user_id,
                input.product_id,
                input.amount,
                input.currency,
                PurchaseStatus::Pending.as_str(),
                input.stripe_checkout_session_id,
                metadata,
                ts,
            ],
        )?;
        self.find_purchase(&id)?
            .ok_or_else(|| StoreError::not_found("purchase", id))
    }

    fn update_purchase(
        &mut self,
        purchase_id: &str,
        update: &PurchaseUpdate,
    ) -> StoreResult<Purchase> {
        let affected = self.conn.execute(
            "UPDATE purchases SET status = ?1, \
             stripe_payment_intent_id = COALESCE(?2, stripe_payment_intent_id), \
             stripe_checkout_session_id = COALESCE(?3, stripe_checkout_session_id), \
             completed_at = COALESCE(?4, completed_at), \
             credits_granted = COALESCE(?5, credits_granted), \
             updated_at = ?6 \
             WHERE id = ?7",
            params![
                update.status.as_str(),
                update.stripe_payment_intent_id,
                update.stripe_checkout_session_id,
                update.completed_at,
                update.credits_granted,
                now(),
                purchase_id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::not_found("purchase", purchase_id));
        }
        self.find_purchase(purchase_id)?
            .ok_or_else(|| StoreError::not_found("purchase", purchase_id))
    }

    fn find_subscription(&self, user_id: &str) -> StoreResult<Option<SubscriptionRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {SUBSCRIPTION_COLS} FROM subscriptions WHERE user_id = ?1"),
                params![user_id],
                subscription_from_row,
            )
            .optional()?)
    }

    fn upsert_subscription(&mut self, record: &SubscriptionRecord) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO subscriptions ({SUBSCRIPTION_COLS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                 ON CONFLICT(user_id) DO UPDATE SET \
                    stripe_customer_id = excluded.stripe_customer_id, \
                    stripe_subscription_id = excluded.stripe_subscription_id, \
                    stripe_price_id = excluded.stripe_price_id, \
                    interval = excluded.interval, \
                    status = excluded.status, \
                    current_period_start = excluded.current_period_start, \
                    current_period_end = excluded.current_period_end, \
                    cancel_at_period_end = excluded.cancel_at_period_end, \
                    payment_method_brand = excluded.payment_method_brand, \
                    payment_method_last4 = excluded.payment_method_last4, \
                    credited_period_start = excluded.credited_period_start, \
                    updated_at = excluded.updated_at"
            ),
            params![
                record.user_id,
                record.stripe_customer_id,
                record.stripe_subscription_id,
                record.stripe_price_id,
                record.interval,
                record.status,
                record.current_period_start,
                record.current_period_end,
                record.cancel_at_period_end,
                record.payment_method_brand,
                record.payment_method_last4,
                record.credited_period_start,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn adjust_credits(&mut self, user_id: &str, delta: i64) -> StoreResult<i64> {
        self.conn
            .query_row(
                "UPDATE users SET credits = credits + ?1 WHERE id = ?2 RETURNING credits",
                params![delta, user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("user", user_id))
    }
}
