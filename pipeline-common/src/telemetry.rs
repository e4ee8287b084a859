//! Telemetry sink handed to every pipeline component.
//!
//! Components never touch the `metrics` macros directly: they receive an
//! `Arc<dyn Telemetry>` at construction, which lets tests observe exactly what
//! was recorded.
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use crate::events::EventType;
use crate::metrics_consts::{
    CONSUME_DURATION, DEAD_LETTER_ENTRIES, EVENTS_PER_SECOND, EVENTS_PROCESSED, PRODUCE_DURATION,
    STORE_OPERATION_DURATION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }
}

/// Persistence calls, labelled in the store latency histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    UpsertUser,
    UpsertOrder,
    UpsertPayment,
    UpsertInventory,
    GetUserOrders,
    GetOrderPayment,
    GetRecentUsers,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::UpsertUser => "upsert_user",
            StoreOperation::UpsertOrder => "upsert_order",
            StoreOperation::UpsertPayment => "upsert_payment",
            StoreOperation::UpsertInventory => "upsert_inventory",
            StoreOperation::GetUserOrders => "get_user_orders",
            StoreOperation::GetOrderPayment => "get_order_payment",
            StoreOperation::GetRecentUsers => "get_recent_users",
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Telemetry: Send + Sync {
    /// Count one dispositioned message. `event_type` is a variant name, or
    /// `unknown` / `unparseable` when the variant could not be determined.
    fn record_processed(&self, event_type: &str, outcome: Outcome);
    fn record_rate(&self, event_type: EventType, per_second: f64);
    fn record_dead_letter(&self);
    fn record_store_latency(&self, operation: StoreOperation, elapsed: Duration);
    fn record_consume_latency(&self, elapsed: Duration);
    fn record_produce_latency(&self, elapsed: Duration);
}

/// Forwards everything to the process-wide `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsTelemetry;

impl Telemetry for MetricsTelemetry {
    fn record_processed(&self, event_type: &str, outcome: Outcome) {
        let labels = [
            ("event_type", event_type.to_owned()),
            ("status", outcome.as_str().to_owned()),
        ];
        metrics::counter!(EVENTS_PROCESSED, &labels).increment(1);
    }

    fn record_rate(&self, event_type: EventType, per_second: f64) {
        metrics::gauge!(EVENTS_PER_SECOND, "event_type" => event_type.as_str()).set(per_second);
    }

    fn record_dead_letter(&self) {
        metrics::counter!(DEAD_LETTER_ENTRIES).increment(1);
    }

    fn record_store_latency(&self, operation: StoreOperation, elapsed: Duration) {
        metrics::histogram!(STORE_OPERATION_DURATION, "operation" => operation.as_str())
            .record(elapsed.as_secs_f64());
    }

    fn record_consume_latency(&self, elapsed: Duration) {
        metrics::histogram!(CONSUME_DURATION).record(elapsed.as_secs_f64());
    }

    fn record_produce_latency(&self, elapsed: Duration) {
        metrics::histogram!(PRODUCE_DURATION).record(elapsed.as_secs_f64());
    }
}

#[derive(Debug, Default)]
struct Recorded {
    processed: HashMap<(String, Outcome), u64>,
    rates: Vec<(EventType, f64)>,
    dead_letters: u64,
    store_operations: Vec<StoreOperation>,
    consume_samples: usize,
    produce_samples: usize,
}

/// Keeps everything in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    recorded: Mutex<Recorded>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Recorded) -> T) -> T {
        let mut recorded = self
            .recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut recorded)
    }

    pub fn processed(&self, event_type: &str, outcome: Outcome) -> u64 {
        self.with(|r| {
            r.processed
                .get(&(event_type.to_owned(), outcome))
                .copied()
                .unwrap_or(0)
        })
    }

    pub fn rates(&self) -> Vec<(EventType, f64)> {
        self.with(|r| r.rates.clone())
    }

    pub fn dead_letters(&self) -> u64 {
        self.with(|r| r.dead_letters)
    }

    pub fn store_operations(&self) -> Vec<StoreOperation> {
        self.with(|r| r.store_operations.clone())
    }

    pub fn consume_samples(&self) -> usize {
        self.with(|r| r.consume_samples)
    }

    pub fn produce_samples(&self) -> usize {
        self.with(|r| r.produce_samples)
    }
}

impl Telemetry for RecordingTelemetry {
    fn record_processed(&self, event_type: &str, outcome: Outcome) {
        self.with(|r| *r.processed.entry((event_type.to_owned(), outcome)).or_default() += 1)
    }

    fn record_rate(&self, event_type: EventType, per_second: f64) {
        self.with(|r| r.rates.push((event_type, per_second)))
    }

    fn record_dead_letter(&self) {
        self.with(|r| r.dead_letters += 1)
    }

    fn record_store_latency(&self, operation: StoreOperation, _elapsed: Duration) {
        self.with(|r| r.store_operations.push(operation))
    }

    fn record_consume_latency(&self, _elapsed: Duration) {
        self.with(|r| r.consume_samples += 1)
    }

    fn record_produce_latency(&self, _elapsed: Duration) {
        self.with(|r| r.produce_samples += 1)
    }
}
