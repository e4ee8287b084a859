use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{EventStore, OrderRecord, PaymentRecord, StoreError, UserRecord};
use crate::events::{InventoryAdjusted, OrderItem, OrderPlaced, PaymentSettled, UserCreated};
use crate::telemetry::StoreOperation;

#[derive(Default)]
struct Tables {
    users: HashMap<String, UserRecord>,
    orders: HashMap<String, OrderRecord>,
    order_items: HashMap<String, Vec<OrderItem>>,
    payments: HashMap<String, (String, PaymentRecord)>,
    inventory: HashMap<String, i64>,
    writes: usize,
    unavailable: bool,
    delay: Option<Duration>,
}

/// In-process `EventStore` with the same keying, replacement and foreign key
/// rules as the relational schema.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following write fail as if the database was unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.tables().unavailable = unavailable;
    }

    /// Delay every following write.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.tables().delay = delay;
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.tables().writes
    }

    pub fn user(&self, user_id: &str) -> Option<UserRecord> {
        self.tables().users.get(user_id).cloned()
    }

    pub fn order(&self, order_id: &str) -> Option<OrderRecord> {
        self.tables().orders.get(order_id).cloned()
    }

    pub fn order_items(&self, order_id: &str) -> Vec<OrderItem> {
        self.tables()
            .order_items
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn payment(&self, payment_id: &str) -> Option<PaymentRecord> {
        self.tables()
            .payments
            .get(payment_id)
            .map(|(_, payment)| payment.clone())
    }

    pub fn inventory(&self, sku: &str) -> Option<i64> {
        self.tables().inventory.get(sku).copied()
    }

    /// Wait out the configured delay, then run `write` under the lock.
    async fn write<F>(&self, operation: StoreOperation, write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Tables) -> Result<(), String>,
    {
        let delay = self.tables().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut tables = self.tables();
        if tables.unavailable {
            return Err(StoreError::Connection {
                operation,
                error: sqlx::Error::PoolClosed,
            });
        }

        write(&mut tables).map_err(|message| StoreError::ConstraintViolation { operation, message })?;
        tables.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_user(&self, event: &UserCreated) -> Result<(), StoreError> {
        self.write(StoreOperation::UpsertUser, |tables| {
            let email_taken = tables
                .users
                .values()
                .any(|user| user.email == event.email && user.user_id != event.user_id);
            if email_taken {
                return Err(format!("duplicate email {}", event.email));
            }

            let now = Utc::now();
            let created_at = tables
                .users
                .get(&event.user_id)
                .map_or(event.created_at, |existing| existing.created_at);
            tables.users.insert(
                event.user_id.clone(),
                UserRecord {
                    user_id: event.user_id.clone(),
                    email: event.email.clone(),
                    first_name: event.first_name.clone(),
                    last_name: event.last_name.clone(),
                    created_at,
                    updated_at: now,
                },
            );
            Ok(())
        })
        .await
    }

    async fn upsert_order(&self, event: &OrderPlaced) -> Result<(), StoreError> {
        self.write(StoreOperation::UpsertOrder, |tables| {
            if !tables.users.contains_key(&event.user_id) {
                return Err(format!("order references unknown user {}", event.user_id));
            }

            let placed_at = tables
                .orders
                .get(&event.order_id)
                .map_or(event.placed_at, |existing| existing.placed_at);
            tables.orders.insert(
                event.order_id.clone(),
                OrderRecord {
                    order_id: event.order_id.clone(),
                    user_id: event.user_id.clone(),
                    total_amount: event.total_amount,
                    currency: event.currency.clone(),
                    placed_at,
                    updated_at: Utc::now(),
                },
            );
            tables
                .order_items
                .insert(event.order_id.clone(), event.items.clone());
            Ok(())
        })
        .await
    }

    async fn upsert_payment(&self, event: &PaymentSettled) -> Result<(), StoreError> {
        self.write(StoreOperation::UpsertPayment, |tables| {
            if !tables.orders.contains_key(&event.order_id) {
                return Err(format!("payment references unknown order {}", event.order_id));
            }

            tables.payments.insert(
                event.payment_id.clone(),
                (
                    event.order_id.clone(),
                    PaymentRecord {
                        payment_id: event.payment_id.clone(),
                        amount: event.amount,
                        currency: event.currency.clone(),
                        payment_method: event.payment_method.clone(),
                        status: event.status.clone(),
                        settled_at: event.settled_at,
                    },
                ),
            );
            Ok(())
        })
        .await
    }

    async fn adjust_inventory(&self, event: &InventoryAdjusted) -> Result<(), StoreError> {
        self.write(StoreOperation::UpsertInventory, |tables| {
            let delta = event
                .delta()
                .ok_or_else(|| format!("quantity {} out of range", event.quantity))?;
            let stock = tables.inventory.entry(event.sku.clone()).or_insert(0);
            *stock = stock
                .checked_add(delta)
                .ok_or_else(|| "bigint out of range".to_owned())?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{inventory_adjusted, order_placed, payment_settled, user_created};

    #[tokio::test]
    async fn mirrors_relational_rules() {
        let store = MemoryStore::new();

        let err = store
            .upsert_order(&order_placed("order-1", "user-1", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { .. }));

        store.upsert_user(&user_created("user-1")).await.unwrap();
        store
            .upsert_order(&order_placed("order-1", "user-1", 4))
            .await
            .unwrap();
        store
            .upsert_order(&order_placed("order-1", "user-1", 2))
            .await
            .unwrap();
        assert_eq!(store.order_items("order-1").len(), 2);

        store
            .upsert_payment(&payment_settled("pay-1", "order-1"))
            .await
            .unwrap();
        assert!(store.payment("pay-1").is_some());

        let adjustment = inventory_adjusted("SKU-1", 3, "add");
        store.adjust_inventory(&adjustment).await.unwrap();
        store.adjust_inventory(&adjustment).await.unwrap();
        assert_eq!(store.inventory("SKU-1"), Some(6));

        assert_eq!(store.writes(), 6);
    }

    #[tokio::test]
    async fn inventory_overflow_is_a_constraint_violation() {
        let store = MemoryStore::new();
        store
            .adjust_inventory(&inventory_adjusted("SKU-1", i64::MAX, "add"))
            .await
            .unwrap();

        let err = store
            .adjust_inventory(&inventory_adjusted("SKU-1", 1, "add"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { .. }));
        assert_eq!(store.inventory("SKU-1"), Some(i64::MAX));

        let err = store
            .adjust_inventory(&inventory_adjusted("SKU-2", i64::MIN, "subtract"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { .. }));
        assert_eq!(store.inventory("SKU-2"), None);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_writes() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store
            .upsert_user(&user_created("user-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connection { .. }));
        assert!(store.user("user-1").is_none());
        assert_eq!(store.writes(), 0);
    }
}
