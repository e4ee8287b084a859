//! Linked sample events for demos and manual runs against a live pipeline.
use chrono::Utc;
use rand::rngs::ThreadRng;
use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

use pipeline_common::events::{
    Envelope, Event, EventType, InventoryAdjusted, OrderItem, OrderPlaced, PaymentSettled,
    UserCreated,
};

const CATALOGUE: &[(&str, f64)] = &[
    ("LAPTOP-PRO-15", 1299.99),
    ("MOUSE-WL-01", 29.99),
    ("KEYBOARD-MX", 89.50),
    ("MONITOR-27-4K", 399.00),
    ("USB-C-HUB", 45.25),
];

const FIRST_NAMES: &[&str] = &["Alice", "Bruno", "Chiara", "Dmitri", "Esi", "Farah"];
const LAST_NAMES: &[&str] = &["Johnson", "Okafor", "Rossi", "Ivanov", "Mensah", "Haddad"];
const PAYMENT_METHODS: &[&str] = &["credit_card", "debit_card", "paypal", "bank_transfer"];

pub struct SampleGenerator<R> {
    rng: R,
}

impl SampleGenerator<ThreadRng> {
    pub fn new() -> Self {
        Self::with_rng(rand::thread_rng())
    }
}

impl Default for SampleGenerator<ThreadRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> SampleGenerator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    fn pick<'a>(&mut self, values: &'a [&'a str]) -> &'a str {
        values.choose(&mut self.rng).copied().unwrap_or_default()
    }

    /// A new user, an order for that user, a settled payment for that order,
    /// then one stock decrement per ordered SKU.
    pub fn round(&mut self) -> Vec<Event> {
        let now = Utc::now();
        let user_id = format!("user-{}", Uuid::now_v7());
        let order_id = format!("order-{}", Uuid::now_v7());

        let first_name = self.pick(FIRST_NAMES);
        let last_name = self.pick(LAST_NAMES);
        let user = UserCreated {
            envelope: Envelope::new(EventType::UserCreated),
            email: format!(
                "{}.{}.{}@example.com",
                first_name.to_lowercase(),
                last_name.to_lowercase(),
                &user_id[user_id.len() - 8..]
            ),
            user_id: user_id.clone(),
            first_name: first_name.to_owned(),
            last_name: last_name.to_owned(),
            created_at: now,
        };

        let item_count = self.rng.gen_range(1..=3);
        let items: Vec<OrderItem> = CATALOGUE
            .choose_multiple(&mut self.rng, item_count)
            .map(|(sku, price)| OrderItem {
                sku: (*sku).to_owned(),
                quantity: self.rng.gen_range(1..=4),
                price: *price,
            })
            .collect();
        let total_amount = items
            .iter()
            .map(|item| item.price * f64::from(item.quantity))
            .sum::<f64>();
        // Cents precision
        let total_amount = (total_amount * 100.0).round() / 100.0;

        let order = OrderPlaced {
            envelope: Envelope::new(EventType::OrderPlaced),
            order_id: order_id.clone(),
            user_id,
            total_amount,
            currency: "USD".to_owned(),
            items: items.clone(),
            placed_at: now,
        };

        let payment = PaymentSettled {
            envelope: Envelope::new(EventType::PaymentSettled),
            payment_id: format!("payment-{}", Uuid::now_v7()),
            order_id: order_id.clone(),
            amount: total_amount,
            currency: "USD".to_owned(),
            payment_method: self.pick(PAYMENT_METHODS).to_owned(),
            status: "completed".to_owned(),
            settled_at: now,
        };

        let mut events = vec![
            Event::UserCreated(user),
            Event::OrderPlaced(order),
            Event::PaymentSettled(payment),
        ];
        events.extend(items.into_iter().map(|item| {
            Event::InventoryAdjusted(InventoryAdjusted {
                envelope: Envelope::new(EventType::InventoryAdjusted),
                sku: item.sku,
                quantity: i64::from(item.quantity),
                adjustment_type: "subtract".to_owned(),
                reason: format!("order {} placed", order_id),
                adjusted_at: now,
            })
        }));

        events
    }
}
