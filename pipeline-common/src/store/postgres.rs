use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{
    recent_users_limit, EventStore, OrderRecord, OrderWithPayment, PaymentRecord, StoreError,
    UserRecord, UserWithOrders, USER_ORDERS_LIMIT,
};
use crate::events::{InventoryAdjusted, OrderItem, OrderPlaced, PaymentSettled, UserCreated};
use crate::telemetry::{StoreOperation, Telemetry};

/// `EventStore` backed by PostgreSQL, also serving the read queries of the API.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    telemetry: Arc<dyn Telemetry>,
}

#[derive(sqlx::FromRow)]
struct OrderPaymentRow {
    #[sqlx(flatten)]
    order: OrderRecord,
    payment_id: Option<String>,
    payment_amount: Option<f64>,
    payment_currency: Option<String>,
    payment_method: Option<String>,
    payment_status: Option<String>,
    settled_at: Option<DateTime<Utc>>,
}

impl OrderPaymentRow {
    fn payment(&mut self) -> Option<PaymentRecord> {
        Some(PaymentRecord {
            payment_id: self.payment_id.take()?,
            amount: self.payment_amount.take()?,
            currency: self.payment_currency.take()?,
            payment_method: self.payment_method.take()?,
            status: self.payment_status.take()?,
            settled_at: self.settled_at.take()?,
        })
    }
}

impl PgStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self::new_from_pool(pool, telemetry))
    }

    pub fn new_from_pool(pool: PgPool, telemetry: Arc<dyn Telemetry>) -> Self {
        Self { pool, telemetry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a query, recording its latency whatever the result.
    async fn timed<T, F>(&self, operation: StoreOperation, query: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let start = Instant::now();
        let result = query.await;
        self.telemetry
            .record_store_latency(operation, start.elapsed());
        result.map_err(|error| StoreError::from_sqlx(operation, error))
    }

    /// A user and their most recently placed orders.
    pub async fn get_user_with_orders(
        &self,
        user_id: &str,
    ) -> Result<Option<UserWithOrders>, StoreError> {
        self.timed(StoreOperation::GetUserOrders, async {
            let user = sqlx::query_as::<_, UserRecord>(
                r#"
SELECT user_id, email, first_name, last_name, created_at, updated_at
FROM users
WHERE user_id = $1
                "#,
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

            let Some(user) = user else {
                return Ok(None);
            };

            let orders = sqlx::query_as::<_, OrderRecord>(
                r#"
SELECT order_id, user_id, total_amount, currency, placed_at, updated_at
FROM orders
WHERE user_id = $1
ORDER BY placed_at DESC
LIMIT $2
                "#,
            )
            .bind(user_id)
            .bind(USER_ORDERS_LIMIT)
            .fetch_all(&self.pool)
            .await?;

            Ok::<_, sqlx::Error>(Some(UserWithOrders { user, orders }))
        })
        .await
    }

    /// An order with its items and, when settled, its latest payment.
    pub async fn get_order_with_payment(
        &self,
        order_id: &str,
    ) -> Result<Option<OrderWithPayment>, StoreError> {
        self.timed(StoreOperation::GetOrderPayment, async {
            let row = sqlx::query_as::<_, OrderPaymentRow>(
                r#"
SELECT
    o.order_id, o.user_id, o.total_amount, o.currency, o.placed_at, o.updated_at,
    p.payment_id, p.amount AS payment_amount, p.currency AS payment_currency,
    p.payment_method, p.status AS payment_status, p.settled_at
FROM orders o
LEFT JOIN payments p ON p.order_id = o.order_id
WHERE o.order_id = $1
ORDER BY p.settled_at DESC NULLS LAST
LIMIT 1
                "#,
            )
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

            let Some(mut row) = row else {
                return Ok(None);
            };

            let items = sqlx::query_as::<_, (String, i32, f64)>(
                "SELECT sku, quantity, price FROM order_items WHERE order_id = $1 ORDER BY id",
            )
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|(sku, quantity, price)| OrderItem {
                sku,
                quantity,
                price,
            })
            .collect();

            let payment = row.payment();
            Ok::<_, sqlx::Error>(Some(OrderWithPayment {
                order: row.order,
                items,
                payment,
            }))
        })
        .await
    }

    /// Most recently created users, newest first.
    pub async fn get_recent_users(&self, limit: Option<i64>) -> Result<Vec<UserRecord>, StoreError> {
        let limit = recent_users_limit(limit);

        self.timed(
            StoreOperation::GetRecentUsers,
            sqlx::query_as::<_, UserRecord>(
                r#"
SELECT user_id, email, first_name, last_name, created_at, updated_at
FROM users
ORDER BY created_at DESC
LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn upsert_user(&self, event: &UserCreated) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
INSERT INTO users (user_id, email, first_name, last_name, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, NOW())
ON CONFLICT (user_id) DO UPDATE SET
    email = EXCLUDED.email,
    first_name = EXCLUDED.first_name,
    last_name = EXCLUDED.last_name,
    updated_at = NOW()
            "#,
        )
        .bind(&event.user_id)
        .bind(&event.email)
        .bind(&event.first_name)
        .bind(&event.last_name)
        .bind(event.created_at)
        .execute(&self.pool);

        self.timed(StoreOperation::UpsertUser, query).await?;
        Ok(())
    }

    async fn upsert_order(&self, event: &OrderPlaced) -> Result<(), StoreError> {
        self.timed(StoreOperation::UpsertOrder, async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
INSERT INTO orders (order_id, user_id, total_amount, currency, placed_at, updated_at)
VALUES ($1, $2, $3, $4, $5, NOW())
ON CONFLICT (order_id) DO UPDATE SET
    user_id = EXCLUDED.user_id,
    total_amount = EXCLUDED.total_amount,
    currency = EXCLUDED.currency,
    updated_at = NOW()
                "#,
            )
            .bind(&event.order_id)
            .bind(&event.user_id)
            .bind(event.total_amount)
            .bind(&event.currency)
            .bind(event.placed_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM order_items WHERE order_id = $1")
                .bind(&event.order_id)
                .execute(&mut *tx)
                .await?;

            if !event.items.is_empty() {
                let skus: Vec<&str> = event.items.iter().map(|i| i.sku.as_str()).collect();
                let quantities: Vec<i32> = event.items.iter().map(|i| i.quantity).collect();
                let prices: Vec<f64> = event.items.iter().map(|i| i.price).collect();

                sqlx::query(
                    r#"
INSERT INTO order_items (order_id, sku, quantity, price)
SELECT $1, item.sku, item.quantity, item.price
FROM UNNEST($2::text[], $3::int[], $4::float8[]) AS item(sku, quantity, price)
                    "#,
                )
                .bind(&event.order_id)
                .bind(&skus)
                .bind(&quantities)
                .bind(&prices)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await
        })
        .await
    }

    async fn upsert_payment(&self, event: &PaymentSettled) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
INSERT INTO payments
    (payment_id, order_id, amount, currency, payment_method, status, settled_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
ON CONFLICT (payment_id) DO UPDATE SET
    order_id = EXCLUDED.order_id,
    amount = EXCLUDED.amount,
    currency = EXCLUDED.currency,
    payment_method = EXCLUDED.payment_method,
    status = EXCLUDED.status,
    settled_at = EXCLUDED.settled_at,
    updated_at = NOW()
            "#,
        )
        .bind(&event.payment_id)
        .bind(&event.order_id)
        .bind(event.amount)
        .bind(&event.currency)
        .bind(&event.payment_method)
        .bind(&event.status)
        .bind(event.settled_at)
        .execute(&self.pool);

        self.timed(StoreOperation::UpsertPayment, query).await?;
        Ok(())
    }

    async fn adjust_inventory(&self, event: &InventoryAdjusted) -> Result<(), StoreError> {
        let delta = event.delta().ok_or_else(|| StoreError::ConstraintViolation {
            operation: StoreOperation::UpsertInventory,
            message: format!("quantity {} out of range", event.quantity),
        })?;
        let query = sqlx::query(
            r#"
INSERT INTO inventory (sku, quantity, updated_at)
VALUES ($1, $2, NOW())
ON CONFLICT (sku) DO UPDATE SET
    quantity = inventory.quantity + EXCLUDED.quantity,
    updated_at = NOW()
            "#,
        )
        .bind(&event.sku)
        .bind(delta)
        .execute(&self.pool);

        self.timed(StoreOperation::UpsertInventory, query).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RecordingTelemetry;
    use crate::test_utils::{inventory_adjusted, order_placed, payment_settled, user_created};

    fn store(db: PgPool) -> (PgStore, Arc<RecordingTelemetry>) {
        let telemetry = Arc::new(RecordingTelemetry::new());
        (PgStore::new_from_pool(db, telemetry.clone()), telemetry)
    }

    async fn count(db: &PgPool, query: &str, key: &str) -> i64 {
        sqlx::query_scalar(query)
            .bind(key)
            .fetch_one(db)
            .await
            .expect("failed to count rows")
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn upsert_user_is_idempotent(db: PgPool) {
        let (store, telemetry) = store(db.clone());
        let mut event = user_created("user-1");

        for _ in 0..3 {
            store.upsert_user(&event).await.expect("failed to upsert user");
        }
        let original_created_at = event.created_at;
        event.email = "ada.lovelace@example.com".to_owned();
        event.created_at = Utc::now();
        store.upsert_user(&event).await.expect("failed to upsert user");

        assert_eq!(
            count(&db, "SELECT COUNT(*) FROM users WHERE user_id = $1", "user-1").await,
            1
        );
        let user = store
            .get_user_with_orders("user-1")
            .await
            .expect("failed to read user")
            .expect("user is missing");
        assert_eq!(user.user.email, "ada.lovelace@example.com");
        assert_eq!(
            user.user.created_at.timestamp_micros(),
            original_created_at.timestamp_micros()
        );
        assert!(telemetry
            .store_operations()
            .contains(&StoreOperation::UpsertUser));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn duplicate_email_is_a_constraint_violation(db: PgPool) {
        let (store, _) = store(db);
        store
            .upsert_user(&user_created("user-1"))
            .await
            .expect("failed to upsert user");

        let mut other = user_created("user-2");
        other.email = user_created("user-1").email;
        let err = store.upsert_user(&other).await.unwrap_err();

        assert!(matches!(err, StoreError::ConstraintViolation { .. }));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn order_without_user_is_a_constraint_violation(db: PgPool) {
        let (store, _) = store(db);
        let err = store
            .upsert_order(&order_placed("order-1", "nobody", 2))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::ConstraintViolation {
                operation: StoreOperation::UpsertOrder,
                ..
            }
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn order_items_are_replaced(db: PgPool) {
        let (store, _) = store(db.clone());
        store.upsert_user(&user_created("user-1")).await.unwrap();

        let order = order_placed("order-1", "user-1", 50);
        store.upsert_order(&order).await.expect("failed to upsert order");
        store.upsert_order(&order).await.expect("failed to upsert order");

        let items_query = "SELECT COUNT(*) FROM order_items WHERE order_id = $1";
        assert_eq!(count(&db, items_query, "order-1").await, 50);

        let smaller = order_placed("order-1", "user-1", 3);
        store.upsert_order(&smaller).await.expect("failed to upsert order");

        assert_eq!(count(&db, items_query, "order-1").await, 3);
        assert_eq!(
            count(&db, "SELECT COUNT(*) FROM orders WHERE order_id = $1", "order-1").await,
            1
        );

        let read = store
            .get_order_with_payment("order-1")
            .await
            .unwrap()
            .expect("order is missing");
        assert_eq!(read.items, smaller.items);
        assert!(read.payment.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn payment_is_overwritten(db: PgPool) {
        let (store, _) = store(db.clone());
        store.upsert_user(&user_created("user-1")).await.unwrap();
        store
            .upsert_order(&order_placed("order-1", "user-1", 1))
            .await
            .unwrap();

        let mut payment = payment_settled("pay-1", "order-1");
        store.upsert_payment(&payment).await.unwrap();
        payment.status = "refunded".to_owned();
        store.upsert_payment(&payment).await.unwrap();

        assert_eq!(
            count(&db, "SELECT COUNT(*) FROM payments WHERE payment_id = $1", "pay-1").await,
            1
        );
        let read = store
            .get_order_with_payment("order-1")
            .await
            .unwrap()
            .expect("order is missing");
        let paid = read.payment.expect("payment is missing");
        assert_eq!(paid.payment_id, "pay-1");
        assert_eq!(paid.status, "refunded");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn inventory_accumulates_on_redelivery(db: PgPool) {
        let (store, _) = store(db.clone());
        let quantity = |db: PgPool| async move {
            sqlx::query_scalar::<_, i64>("SELECT quantity FROM inventory WHERE sku = $1")
                .bind("SKU-X")
                .fetch_one(&db)
                .await
                .unwrap()
        };

        store
            .adjust_inventory(&inventory_adjusted("SKU-X", 10, "add"))
            .await
            .unwrap();
        assert_eq!(quantity(db.clone()).await, 10);

        store
            .adjust_inventory(&inventory_adjusted("SKU-X", -50, "returned"))
            .await
            .unwrap();
        assert_eq!(quantity(db.clone()).await, -40);

        // The same adjustment delivered twice is applied twice.
        let restock = inventory_adjusted("SKU-X", 5, "subtract");
        store.adjust_inventory(&restock).await.unwrap();
        store.adjust_inventory(&restock).await.unwrap();
        assert_eq!(quantity(db).await, -50);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn user_orders_are_latest_first_and_capped(db: PgPool) {
        let (store, _) = store(db);
        store.upsert_user(&user_created("user-1")).await.unwrap();

        let base = Utc::now();
        for i in 0..7 {
            let mut order = order_placed(&format!("order-{}", i), "user-1", 1);
            order.placed_at = base + chrono::Duration::minutes(i);
            store.upsert_order(&order).await.unwrap();
        }

        let user = store
            .get_user_with_orders("user-1")
            .await
            .unwrap()
            .expect("user is missing");
        let ids: Vec<&str> = user.orders.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["order-6", "order-5", "order-4", "order-3", "order-2"]);

        assert!(store.get_user_with_orders("missing").await.unwrap().is_none());
        assert!(store.get_order_with_payment("missing").await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn recent_users_newest_first(db: PgPool) {
        let (store, telemetry) = store(db);
        let base = Utc::now();
        for i in 0..8 {
            let mut user = user_created(&format!("user-{}", i));
            user.created_at = base + chrono::Duration::seconds(i);
            store.upsert_user(&user).await.unwrap();
        }

        let users = store.get_recent_users(None).await.unwrap();
        assert_eq!(users.len(), 5);
        assert_eq!(users[0].user_id, "user-7");

        let users = store.get_recent_users(Some(2)).await.unwrap();
        let ids: Vec<&str> = users.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["user-7", "user-6"]);

        assert!(telemetry
            .store_operations()
            .contains(&StoreOperation::GetRecentUsers));
    }
}
