//! Event builders shared by the tests of every pipeline crate.
use chrono::{DateTime, TimeZone, Utc};
use rand::{distributions::Alphanumeric, Rng};

use crate::events::{
    Envelope, EventType, InventoryAdjusted, OrderItem, OrderPlaced, PaymentSettled, UserCreated,
};

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn user_created(user_id: &str) -> UserCreated {
    UserCreated {
        envelope: Envelope::new(EventType::UserCreated),
        user_id: user_id.to_owned(),
        email: format!("{}@example.com", user_id),
        first_name: "Ada".to_owned(),
        last_name: "Lovelace".to_owned(),
        created_at: fixed_time(),
    }
}

/// An order with `item_count` distinct line items.
pub fn order_placed(order_id: &str, user_id: &str, item_count: usize) -> OrderPlaced {
    let items: Vec<OrderItem> = (0..item_count)
        .map(|i| OrderItem {
            sku: format!("SKU-{:03}", i),
            quantity: 1 + (i % 3) as i32,
            price: 9.99,
        })
        .collect();
    let total_amount = items
        .iter()
        .map(|item| item.price * f64::from(item.quantity))
        .sum();

    OrderPlaced {
        envelope: Envelope::new(EventType::OrderPlaced),
        order_id: order_id.to_owned(),
        user_id: user_id.to_owned(),
        total_amount,
        currency: "USD".to_owned(),
        items,
        placed_at: fixed_time(),
    }
}

pub fn payment_settled(payment_id: &str, order_id: &str) -> PaymentSettled {
    PaymentSettled {
        envelope: Envelope::new(EventType::PaymentSettled),
        payment_id: payment_id.to_owned(),
        order_id: order_id.to_owned(),
        amount: 19.98,
        currency: "USD".to_owned(),
        payment_method: "card".to_owned(),
        status: "settled".to_owned(),
        settled_at: fixed_time(),
    }
}

pub fn inventory_adjusted(sku: &str, quantity: i64, adjustment_type: &str) -> InventoryAdjusted {
    InventoryAdjusted {
        envelope: Envelope::new(EventType::InventoryAdjusted),
        sku: sku.to_owned(),
        quantity,
        adjustment_type: adjustment_type.to_owned(),
        reason: "stock count".to_owned(),
        adjusted_at: fixed_time(),
    }
}
