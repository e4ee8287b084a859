//! Turns one raw message into a disposition: persisted, or dead-lettered.
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipeline_common::dead_letter::{DeadLetterRecord, DeadLetterSink};
use pipeline_common::events::{salvage_event_id, Envelope, Event, EventType};
use pipeline_common::store::{EventStore, StoreError};
use pipeline_common::telemetry::{Outcome, StoreOperation, Telemetry};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::ProcessingError;
use crate::rate::RateCounter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Persisted {
        event_type: EventType,
        event_id: String,
    },
    DeadLettered {
        /// The `event_type` label the error was counted under.
        label: &'static str,
        error: String,
    },
}

pub struct EventProcessor {
    /// Where decoded events are written.
    store: Arc<dyn EventStore>,
    /// Where undecodable or unwritable messages are parked.
    dead_letters: Arc<dyn DeadLetterSink>,
    telemetry: Arc<dyn Telemetry>,
    /// Successful events, sampled into the rate gauge.
    rates: Arc<RateCounter>,
    /// Upper bound for a single store write.
    store_timeout: Duration,
}

fn store_operation(event: &Event) -> StoreOperation {
    match event {
        Event::UserCreated(_) => StoreOperation::UpsertUser,
        Event::OrderPlaced(_) => StoreOperation::UpsertOrder,
        Event::PaymentSettled(_) => StoreOperation::UpsertPayment,
        Event::InventoryAdjusted(_) => StoreOperation::UpsertInventory,
    }
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn EventStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        telemetry: Arc<dyn Telemetry>,
        rates: Arc<RateCounter>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            dead_letters,
            telemetry,
            rates,
            store_timeout,
        }
    }

    /// Disposition one message payload. Never fails: every error ends up in
    /// the dead letter queue, or in the logs if that queue is unavailable.
    pub async fn process(&self, payload: &[u8]) -> Disposition {
        let start = Instant::now();

        let disposition = match self.handle(payload).await {
            Ok(event) => {
                let event_type = event.event_type();
                self.telemetry
                    .record_processed(event_type.as_str(), Outcome::Success);
                self.rates.increment(event_type);
                info!(
                    event_id = event.event_id(),
                    event_type = event_type.as_str(),
                    key = event.key(),
                    "event persisted"
                );
                Disposition::Persisted {
                    event_type,
                    event_id: event.event_id().to_owned(),
                }
            }
            Err(err) => self.dead_letter(payload, err).await,
        };

        self.telemetry.record_consume_latency(start.elapsed());
        disposition
    }

    async fn handle(&self, payload: &[u8]) -> Result<Event, ProcessingError> {
        let envelope = Envelope::from_slice(payload).map_err(|error| ProcessingError::Decode {
            event_id: salvage_event_id(payload),
            error,
        })?;
        let decode_error = |error| ProcessingError::Decode {
            event_id: envelope.event_id.clone(),
            error,
        };

        let event_type = envelope.kind().map_err(decode_error)?;
        let event = Event::decode_as(event_type, payload).map_err(decode_error)?;

        self.persist(&event)
            .await
            .map_err(|error| ProcessingError::Store {
                event_id: envelope.event_id.clone(),
                event_type,
                error,
            })?;

        Ok(event)
    }

    async fn persist(&self, event: &Event) -> Result<(), StoreError> {
        let write = async {
            match event {
                Event::UserCreated(user) => self.store.upsert_user(user).await,
                Event::OrderPlaced(order) => self.store.upsert_order(order).await,
                Event::PaymentSettled(payment) => self.store.upsert_payment(payment).await,
                Event::InventoryAdjusted(adjustment) => {
                    self.store.adjust_inventory(adjustment).await
                }
            }
        };

        match timeout(self.store_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation: store_operation(event),
                timeout: self.store_timeout,
            }),
        }
    }

    async fn dead_letter(&self, payload: &[u8], err: ProcessingError) -> Disposition {
        let label = err.label();
        let error = err.to_string();
        warn!(
            event_id = err.event_id(),
            event_type = label,
            error = %error,
            "failed to process message"
        );

        let record = DeadLetterRecord::new(err.event_id(), payload, error.clone());
        if let Err(e) = self.dead_letters.push(&record).await {
            error!(
                event_id = err.event_id(),
                error = %e,
                "failed to push message to dead letter queue"
            );
        }

        self.telemetry.record_processed(label, Outcome::Error);
        Disposition::DeadLettered { label, error }
    }
}
