use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::{debug, error, info};

use pipeline_common::events::Event;
use pipeline_common::telemetry::Telemetry;

use crate::config::Config;

pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("failed to create kafka producer: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("event too big for the broker")]
    EventTooBig,
    #[error("failed to deliver event: {0}")]
    Delivery(KafkaError),
}

/// Where the broker stored a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub partition: i32,
    pub offset: i64,
}

/// Publishes events keyed by their business key, so every event about the
/// same entity lands on the same partition.
#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    telemetry: Arc<dyn Telemetry>,
}

impl EventProducer {
    pub fn new(config: &Config, telemetry: Arc<dyn Telemetry>) -> Result<Self, ProducerError> {
        let mut client_config = ClientConfig::from(&config.kafka);
        client_config
            .set("client.id", "event-producer")
            .set("acks", "all")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec);

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext)?;
        info!(
            hosts = %config.kafka.kafka_hosts,
            topic = config.kafka.kafka_topic.as_str(),
            "kafka producer created"
        );

        Ok(Self {
            producer,
            topic: config.kafka.kafka_topic.as_str().to_owned(),
            telemetry,
        })
    }

    /// Publish one event and wait for the broker acknowledgement.
    pub async fn publish(&self, event: &Event) -> Result<Delivered, ProducerError> {
        let start = Instant::now();
        let result = self.send(event).await;
        self.telemetry.record_produce_latency(start.elapsed());

        match &result {
            Ok(delivered) => debug!(
                event_id = event.event_id(),
                event_type = %event.event_type(),
                partition = delivered.partition,
                offset = delivered.offset,
                "event published"
            ),
            Err(e) => error!(
                event_id = event.event_id(),
                event_type = %event.event_type(),
                error = %e,
                "failed to publish event"
            ),
        }
        result
    }

    async fn send(&self, event: &Event) -> Result<Delivered, ProducerError> {
        let payload = event.to_json()?;

        let delivery = self
            .producer
            .send_result(FutureRecord {
                topic: self.topic.as_str(),
                payload: Some(&payload),
                partition: None,
                key: Some(event.key()),
                timestamp: None,
                headers: None,
            })
            .map_err(|(e, _)| delivery_error(e))?;

        match delivery.await {
            // Cancelled due to timeout while retrying
            Err(_) => Err(ProducerError::Delivery(KafkaError::Canceled)),
            Ok(Err((e, _))) => Err(delivery_error(e)),
            Ok(Ok((partition, offset))) => Ok(Delivered { partition, offset }),
        }
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }
}

fn delivery_error(e: KafkaError) -> ProducerError {
    match e.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => ProducerError::EventTooBig,
        _ => ProducerError::Delivery(e),
    }
}
