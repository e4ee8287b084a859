//! Append-only store for messages the pipeline could not persist.
//!
//! Records are JSON documents appended to the tail of a Redis list, so the
//! sink keeps working while the relational store is down. Nothing in the
//! pipeline ever rewrites or removes an entry.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::telemetry::Telemetry;

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to serialize dead letter record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("dead letter queue did not answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub event_id: String,
    pub original_data: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    /// Always 0 when written by the pipeline.
    pub retry_count: u32,
}

impl DeadLetterRecord {
    /// `original_data` is kept verbatim, invalid UTF-8 is replaced lossily.
    pub fn new(event_id: &str, original_data: &[u8], error: String) -> Self {
        Self {
            event_id: event_id.to_owned(),
            original_data: String::from_utf8_lossy(original_data).into_owned(),
            error,
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append a record to the tail.
    async fn push(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError>;

    async fn count(&self) -> Result<u64, DeadLetterError>;

    /// Inclusive slice by position, negative positions count from the tail.
    /// Entries that no longer decode are logged and skipped.
    async fn range(&self, start: i64, stop: i64) -> Result<Vec<DeadLetterRecord>, DeadLetterError>;
}

fn decode_entries(raw: Vec<String>) -> Vec<DeadLetterRecord> {
    raw.into_iter()
        .filter_map(|entry| match serde_json::from_str(&entry) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(error = %e, "skipping undecodable dead letter entry");
                None
            }
        })
        .collect()
}

/// Dead letters kept in a Redis list.
#[derive(Clone)]
pub struct RedisDeadLetterQueue {
    connection: MultiplexedConnection,
    key: String,
    timeout: Duration,
    telemetry: Arc<dyn Telemetry>,
}

impl RedisDeadLetterQueue {
    pub async fn new(
        url: &str,
        key: &str,
        timeout: Duration,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, DeadLetterError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;

        Ok(Self {
            connection,
            key: key.to_owned(),
            timeout,
            telemetry,
        })
    }

    async fn bounded<T, F>(&self, command: F) -> Result<T, DeadLetterError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.timeout, command).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeadLetterError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterQueue {
    async fn push(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_string(record)?;
        let mut connection = self.connection.clone();

        self.bounded(connection.rpush::<_, _, i64>(&self.key, payload))
            .await?;
        self.telemetry.record_dead_letter();

        warn!(
            event_id = %record.event_id,
            error = %record.error,
            "message pushed to dead letter queue"
        );
        Ok(())
    }

    async fn count(&self) -> Result<u64, DeadLetterError> {
        let mut connection = self.connection.clone();
        self.bounded(connection.llen::<_, u64>(&self.key)).await
    }

    async fn range(&self, start: i64, stop: i64) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let mut connection = self.connection.clone();
        let raw: Vec<String> = self
            .bounded(connection.lrange(&self.key, start as isize, stop as isize))
            .await?;

        Ok(decode_entries(raw))
    }
}

/// Resolve an LRANGE-style inclusive range against a list of `len` entries.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<std::ops::RangeInclusive<usize>> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if start > stop || start >= len {
        return None;
    }
    Some(usize::try_from(start).ok()?..=usize::try_from(stop).ok()?)
}

/// In-process sink with the same list semantics, for tests and for running
/// without Redis.
#[derive(Clone)]
pub struct MemoryDeadLetterQueue {
    entries: Arc<Mutex<Vec<String>>>,
    unavailable: Arc<AtomicBool>,
    telemetry: Arc<dyn Telemetry>,
}

impl MemoryDeadLetterQueue {
    pub fn new(telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            entries: Default::default(),
            unavailable: Default::default(),
            telemetry,
        }
    }

    /// Make every following push fail as if Redis was unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every decodable record, oldest first.
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        decode_entries(self.entries().clone())
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterQueue {
    async fn push(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "dead letter queue unavailable",
            ))
            .into());
        }

        let payload = serde_json::to_string(record)?;
        self.entries().push(payload);
        self.telemetry.record_dead_letter();

        warn!(
            event_id = %record.event_id,
            error = %record.error,
            "message pushed to dead letter queue"
        );
        Ok(())
    }

    async fn count(&self) -> Result<u64, DeadLetterError> {
        Ok(self.entries().len() as u64)
    }

    async fn range(&self, start: i64, stop: i64) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let entries = self.entries();
        let raw = match resolve_range(entries.len(), start, stop) {
            Some(range) => entries[range].to_vec(),
            None => Vec::new(),
        };
        Ok(decode_entries(raw))
    }
}
