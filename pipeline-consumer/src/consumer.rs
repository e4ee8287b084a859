//! The pull, process and commit loop.
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::processor::{Disposition, EventProcessor};
use crate::source::MessageSource;

/// Reads messages one at a time, in delivery order, and commits each one
/// after its disposition is known, whatever that disposition is.
pub struct EventConsumer {
    /// The broker, or a stand-in for it.
    source: Arc<dyn MessageSource>,
    processor: EventProcessor,
    /// How long a single poll waits for a message.
    poll_timeout: Duration,
    /// The liveness check handle, reported on every iteration.
    liveness: HealthHandle,
}

impl EventConsumer {
    pub fn new(
        source: Arc<dyn MessageSource>,
        processor: EventProcessor,
        poll_timeout: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            source,
            processor,
            poll_timeout,
            liveness,
        }
    }

    /// Run until `shutdown` turns true. The flag is checked before each poll,
    /// so a message being processed is always finished and committed.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!("starting consumer loop");

        loop {
            if *shutdown.borrow() {
                info!("shutdown signal received, stopping consumer loop");
                break;
            }

            self.liveness.report_healthy();
            self.step().await;
        }
    }

    /// Poll once, then process and commit the message if one arrived.
    pub async fn step(&self) -> Option<Disposition> {
        let message = match self.source.poll(self.poll_timeout).await {
            Ok(Some(message)) => message,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "failed to receive message");
                tokio::time::sleep(self.poll_timeout).await;
                return None;
            }
        };

        debug!(
            partition = message.partition,
            offset = message.offset,
            key = message.key.as_deref().unwrap_or_default(),
            "received message"
        );

        let disposition = self.processor.process(message.payload()).await;

        if let Err(e) = self.source.commit(&message).await {
            error!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "failed to commit offset"
            );
        }

        Some(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use pipeline_common::dead_letter::{DeadLetterSink, MemoryDeadLetterQueue};
    use pipeline_common::events::{Event, EventType};
    use pipeline_common::store::MemoryStore;
    use pipeline_common::telemetry::{Outcome, RecordingTelemetry};
    use pipeline_common::test_utils::{order_placed, user_created};

    use crate::rate::RateCounter;
    use crate::source::MemorySource;

    struct Harness {
        consumer: EventConsumer,
        source: Arc<MemorySource>,
        store: Arc<MemoryStore>,
        dead_letters: Arc<MemoryDeadLetterQueue>,
        telemetry: Arc<RecordingTelemetry>,
        registry: HealthRegistry,
    }

    fn harness(payloads: Vec<Vec<u8>>) -> Harness {
        let source = Arc::new(MemorySource::new(payloads));
        let store = Arc::new(MemoryStore::new());
        let telemetry = Arc::new(RecordingTelemetry::new());
        let dead_letters = Arc::new(MemoryDeadLetterQueue::new(telemetry.clone()));
        let processor = EventProcessor::new(
            store.clone(),
            dead_letters.clone(),
            telemetry.clone(),
            Arc::new(RateCounter::default()),
            Duration::from_secs(1),
        );
        let registry = HealthRegistry::new("liveness");
        let consumer = EventConsumer::new(
            source.clone(),
            processor,
            Duration::from_millis(5),
            registry.register("consumer", time::Duration::seconds(30)),
        );

        Harness {
            consumer,
            source,
            store,
            dead_letters,
            telemetry,
            registry,
        }
    }

    fn encode(event: Event) -> Vec<u8> {
        event.to_json().unwrap().into_bytes()
    }

    #[tokio::test]
    async fn commits_after_every_disposition() {
        let h = harness(vec![
            encode(Event::UserCreated(user_created("user-1"))),
            b"definitely not json".to_vec(),
            encode(Event::OrderPlaced(order_placed("order-1", "user-1", 3))),
        ]);

        assert!(matches!(
            h.consumer.step().await,
            Some(Disposition::Persisted { .. })
        ));
        assert_eq!(h.source.committed(), Some(0));

        assert!(matches!(
            h.consumer.step().await,
            Some(Disposition::DeadLettered { .. })
        ));
        assert_eq!(h.source.committed(), Some(1));

        assert!(matches!(
            h.consumer.step().await,
            Some(Disposition::Persisted {
                event_type: EventType::OrderPlaced,
                ..
            })
        ));
        assert_eq!(h.source.committed(), Some(2));

        // Nothing is delivered again after a restart.
        h.source.restart();
        assert_eq!(h.consumer.step().await, None);
        assert_eq!(h.dead_letters.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_commit_does_not_stop_processing() {
        let h = harness(vec![
            encode(Event::UserCreated(user_created("user-1"))),
            encode(Event::UserCreated(user_created("user-2"))),
        ]);
        h.source.set_fail_commits(true);

        h.consumer.step().await;
        h.consumer.step().await;

        assert!(h.store.user("user-1").is_some());
        assert!(h.store.user("user-2").is_some());
        assert_eq!(h.source.committed(), None);
    }

    #[tokio::test]
    async fn dead_letter_outage_does_not_block_commit() {
        let h = harness(vec![
            br#"{"eventId":"evt-1","eventType":"Refund","timestamp":"2024-06-01T10:00:00Z"}"#
                .to_vec(),
        ]);
        h.dead_letters.set_unavailable(true);

        let disposition = h.consumer.step().await;

        assert!(matches!(
            disposition,
            Some(Disposition::DeadLettered {
                label: "unknown",
                ..
            })
        ));
        assert_eq!(h.source.committed(), Some(0));
        assert_eq!(h.telemetry.processed("unknown", Outcome::Error), 1);
        assert_eq!(h.telemetry.dead_letters(), 0);
        assert_eq!(h.dead_letters.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unnegatable_inventory_subtraction_is_dead_lettered() {
        let payload = format!(
            r#"{{"eventId":"evt-1","eventType":"InventoryAdjusted","timestamp":"2024-06-01T10:00:00Z","sku":"SKU-1","quantity":{},"adjustmentType":"subtract","adjustedAt":"2024-06-01T10:00:00Z"}}"#,
            i64::MIN
        );
        let h = harness(vec![
            payload.into_bytes(),
            encode(Event::UserCreated(user_created("user-1"))),
        ]);

        let disposition = h.consumer.step().await;

        let Some(Disposition::DeadLettered { label, error }) = disposition else {
            panic!("out of range adjustment was not dead-lettered");
        };
        assert_eq!(label, "InventoryAdjusted");
        assert!(error.contains("out of range"));
        assert_eq!(h.source.committed(), Some(0));
        assert_eq!(h.store.inventory("SKU-1"), None);
        assert_eq!(h.dead_letters.records()[0].event_id, "evt-1");

        // The partition keeps moving.
        h.consumer.step().await;
        assert_eq!(h.source.committed(), Some(1));
        assert!(h.store.user("user-1").is_some());
    }

    #[tokio::test]
    async fn tombstone_is_unparseable() {
        let h = harness(vec![]);
        h.source.append(None);

        let disposition = h.consumer.step().await;

        assert!(matches!(
            disposition,
            Some(Disposition::DeadLettered {
                label: "unparseable",
                ..
            })
        ));
        assert_eq!(h.dead_letters.records()[0].original_data, "");
        assert_eq!(h.source.committed(), Some(0));
    }

    #[tokio::test]
    async fn run_drains_then_stops_on_shutdown() {
        let h = harness(vec![
            encode(Event::UserCreated(user_created("user-1"))),
            br#"{"eventId":"evt-2","eventType":"Refund","timestamp":"2024-06-01T10:00:00Z"}"#
                .to_vec(),
        ]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = h.consumer;
        let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.source.committed() != Some(1) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.registry.get_status().healthy);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer did not stop")
            .unwrap();

        assert_eq!(h.source.committed(), Some(1));
        assert_eq!(h.telemetry.processed("UserCreated", Outcome::Success), 1);
        assert_eq!(h.telemetry.processed("unknown", Outcome::Error), 1);
    }
}
