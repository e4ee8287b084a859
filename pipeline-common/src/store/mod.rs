//! Persistence of decoded events into the relational store.
//!
//! Every write is keyed by the event's business key and safe to repeat, with
//! one exception: inventory adjustments add their delta on every delivery, so
//! a redelivered adjustment is applied twice.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::events::{InventoryAdjusted, OrderItem, OrderPlaced, PaymentSettled, UserCreated};
use crate::telemetry::StoreOperation;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Default and upper bound for the recent users listing.
pub const DEFAULT_RECENT_USERS: i64 = 5;
pub const MAX_RECENT_USERS: i64 = 100;

/// Number of orders returned alongside a user.
pub const USER_ORDERS_LIMIT: i64 = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{operation} rejected by a constraint: {message}")]
    ConstraintViolation {
        operation: StoreOperation,
        message: String,
    },
    #[error("{operation} failed to reach the database: {error}")]
    Connection {
        operation: StoreOperation,
        error: sqlx::Error,
    },
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: StoreOperation,
        timeout: Duration,
    },
    #[error("{operation} query failed with: {error}")]
    Query {
        operation: StoreOperation,
        error: sqlx::Error,
    },
}

impl StoreError {
    /// Sort a driver error into constraint, connectivity or generic query failure.
    /// SQLSTATE classes 22 (data exception) and 23 (integrity constraint) are
    /// reported as constraint violations.
    pub fn from_sqlx(operation: StoreOperation, error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| code.starts_with("22") || code.starts_with("23")) =>
            {
                StoreError::ConstraintViolation {
                    operation,
                    message: db.message().to_owned(),
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection { operation, error },
            _ => StoreError::Query { operation, error },
        }
    }

    pub fn operation(&self) -> StoreOperation {
        match self {
            StoreError::ConstraintViolation { operation, .. }
            | StoreError::Connection { operation, .. }
            | StoreError::Timeout { operation, .. }
            | StoreError::Query { operation, .. } => *operation,
        }
    }
}

/// One idempotent write per event variant.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert the user, or overwrite its mutable fields. `created_at` is kept.
    async fn upsert_user(&self, event: &UserCreated) -> Result<(), StoreError>;

    /// Insert or update the order and replace its whole item set, atomically.
    async fn upsert_order(&self, event: &OrderPlaced) -> Result<(), StoreError>;

    /// Insert the payment, or overwrite every field of it.
    async fn upsert_payment(&self, event: &PaymentSettled) -> Result<(), StoreError>;

    /// Seed the stock level with the delta, or add the delta to it.
    /// Not idempotent: every delivery applies the delta again.
    async fn adjust_inventory(&self, event: &InventoryAdjusted) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub order_id: String,
    pub user_id: String,
    pub total_amount: f64,
    pub currency: String,
    pub placed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub payment_id: String,
    pub amount: f64,
    pub currency: String,
    pub payment_method: String,
    pub status: String,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserWithOrders {
    #[serde(flatten)]
    pub user: UserRecord,
    pub orders: Vec<OrderRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWithPayment {
    #[serde(flatten)]
    pub order: OrderRecord,
    pub items: Vec<OrderItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentRecord>,
}

/// Clamp a requested listing size, falling back to the default when out of range.
pub fn recent_users_limit(requested: Option<i64>) -> i64 {
    match requested {
        Some(limit) if (1..=MAX_RECENT_USERS).contains(&limit) => limit,
        _ => DEFAULT_RECENT_USERS,
    }
}
