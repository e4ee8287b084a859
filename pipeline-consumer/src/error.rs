use pipeline_common::events::{DecodeError, EventType};
use pipeline_common::store::StoreError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors from the broker connection itself, as opposed to a single message.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// Why one message ended up in the dead letter queue.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("{error}")]
    Decode { event_id: String, error: DecodeError },
    #[error("{error}")]
    Store {
        event_id: String,
        event_type: EventType,
        error: StoreError,
    },
}

impl ProcessingError {
    /// May be empty when the envelope itself could not be decoded.
    pub fn event_id(&self) -> &str {
        match self {
            ProcessingError::Decode { event_id, .. } | ProcessingError::Store { event_id, .. } => {
                event_id
            }
        }
    }

    /// `event_type` label for the error counter.
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingError::Decode {
                error: DecodeError::Envelope(_),
                ..
            } => "unparseable",
            ProcessingError::Decode {
                error: DecodeError::UnknownEventType(_),
                ..
            } => "unknown",
            ProcessingError::Decode {
                error:
                    DecodeError::Payload { event_type, .. }
                    | DecodeError::EmptyKey { event_type, .. }
                    | DecodeError::QuantityOutOfRange { event_type, .. },
                ..
            }
            | ProcessingError::Store { event_type, .. } => event_type.as_str(),
        }
    }
}
