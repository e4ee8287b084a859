//! Where the consumer loop reads messages from and records its progress.
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::timeout;
use tracing::info;

use pipeline_common::config::KafkaConfig;

use crate::error::ConsumerError;

/// A message copied out of the broker client, owned by the pipeline until
/// its offset is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// `None` for tombstones.
    pub payload: Option<Vec<u8>>,
}

impl InboundMessage {
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait up to `wait` for the next message, `Ok(None)` if none arrived.
    async fn poll(&self, wait: Duration) -> Result<Option<InboundMessage>, ConsumerError>;

    /// Record `message` as consumed. Returns once the commit is acknowledged.
    async fn commit(&self, message: &InboundMessage) -> Result<(), ConsumerError>;
}

pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig, group_id: &str) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::from(config);
        client_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_topic.as_str()])?;

        info!(
            topic = config.kafka_topic.as_str(),
            group_id, "kafka consumer subscribed"
        );

        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn poll(&self, wait: Duration) -> Result<Option<InboundMessage>, ConsumerError> {
        match timeout(wait, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(message)) => Ok(Some(InboundMessage {
                topic: message.topic().to_owned(),
                partition: message.partition(),
                offset: message.offset(),
                key: message
                    .key()
                    .map(|key| String::from_utf8_lossy(key).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec),
            })),
        }
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), ConsumerError> {
        // The committed offset is the next one to read.
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Sync)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryPartition {
    messages: Vec<InboundMessage>,
    position: usize,
    committed: Option<i64>,
    fail_commits: bool,
}

/// A single in-memory partition, for tests.
#[derive(Default)]
pub struct MemorySource {
    partition: Mutex<MemoryPartition>,
}

impl MemorySource {
    pub fn new<I>(payloads: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let source = Self::default();
        for payload in payloads {
            source.append(Some(payload));
        }
        source
    }

    fn partition(&self) -> std::sync::MutexGuard<'_, MemoryPartition> {
        self.partition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message at the next offset. `None` appends a tombstone.
    pub fn append(&self, payload: Option<Vec<u8>>) {
        let mut partition = self.partition();
        let offset = partition.messages.len() as i64;
        partition.messages.push(InboundMessage {
            topic: "events".to_owned(),
            partition: 0,
            offset,
            key: None,
            payload,
        });
    }

    /// Offset of the last committed message.
    pub fn committed(&self) -> Option<i64> {
        self.partition().committed
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.partition().fail_commits = fail;
    }

    /// Resume from the committed position, as a restarted consumer would.
    pub fn restart(&self) {
        let mut partition = self.partition();
        partition.position = partition
            .committed
            .map_or(0, |offset| usize::try_from(offset + 1).unwrap_or(0));
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn poll(&self, wait: Duration) -> Result<Option<InboundMessage>, ConsumerError> {
        let message = {
            let mut partition = self.partition();
            let message = partition.messages.get(partition.position).cloned();
            if message.is_some() {
                partition.position += 1;
            }
            message
        };

        if message.is_none() {
            tokio::time::sleep(wait).await;
        }
        Ok(message)
    }

    async fn commit(&self, message: &InboundMessage) -> Result<(), ConsumerError> {
        let mut partition = self.partition();
        if partition.fail_commits {
            return Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::BrokerTransportFailure).into());
        }
        partition.committed = Some(message.offset);
        Ok(())
    }
}
