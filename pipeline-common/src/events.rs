//! Domain events carried on the pipeline topic.
//!
//! Every message is a flat JSON object: the envelope fields (`eventId`,
//! `eventType`, `timestamp`) sit next to the fields of the variant named by
//! `eventType`. Decoding happens in two passes so that a failure can be
//! attributed: first the envelope alone, then the full variant.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    UserCreated,
    OrderPlaced,
    PaymentSettled,
    InventoryAdjusted,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::UserCreated,
        EventType::OrderPlaced,
        EventType::PaymentSettled,
        EventType::InventoryAdjusted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserCreated => "UserCreated",
            EventType::OrderPlaced => "OrderPlaced",
            EventType::PaymentSettled => "PaymentSettled",
            EventType::InventoryAdjusted => "InventoryAdjusted",
        }
    }

    /// Position of this variant in `ALL`.
    pub fn index(&self) -> usize {
        match self {
            EventType::UserCreated => 0,
            EventType::OrderPlaced => 1,
            EventType::PaymentSettled => 2,
            EventType::InventoryAdjusted => 3,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_owned()))
    }
}

/// Header fields shared by all events.
///
/// `event_type` is kept as the raw string so that an envelope naming an
/// unknown variant still decodes and can be reported as such.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// A fresh envelope with a time-ordered id, stamped now.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            event_type: event_type.as_str().to_owned(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(payload).map_err(DecodeError::Envelope)
    }

    pub fn kind(&self) -> Result<EventType, DecodeError> {
        self.event_type
            .parse()
            .map_err(|UnknownEventType(name)| DecodeError::UnknownEventType(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreated {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub user_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub sku: String,
    pub quantity: i32,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub order_id: String,
    pub user_id: String,
    pub total_amount: f64,
    pub currency: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSettled {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub payment_id: String,
    pub order_id: String,
    pub amount: f64,
    pub currency: String,
    pub payment_method: String,
    pub status: String,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryAdjusted {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub sku: String,
    pub quantity: i64,
    pub adjustment_type: String,
    #[serde(default)]
    pub reason: String,
    pub adjusted_at: DateTime<Utc>,
}

impl InventoryAdjusted {
    /// Signed change to apply to the stock level. Only `subtract` flips the
    /// sign, any other adjustment type applies `quantity` as given. `None` when
    /// the flipped quantity does not fit in an `i64`.
    pub fn delta(&self) -> Option<i64> {
        if self.adjustment_type == "subtract" {
            self.quantity.checked_neg()
        } else {
            Some(self.quantity)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    UserCreated(UserCreated),
    OrderPlaced(OrderPlaced),
    PaymentSettled(PaymentSettled),
    InventoryAdjusted(InventoryAdjusted),
}

impl Event {
    /// Decode a full message: envelope, then the variant it names.
    pub fn decode(payload: &[u8]) -> Result<Event, DecodeError> {
        let event_type = Envelope::from_slice(payload)?.kind()?;
        Event::decode_as(event_type, payload)
    }

    /// Decode a message whose variant is already known from its envelope.
    pub fn decode_as(event_type: EventType, payload: &[u8]) -> Result<Event, DecodeError> {
        let payload_error = |source| DecodeError::Payload { event_type, source };

        let event = match event_type {
            EventType::UserCreated => {
                Event::UserCreated(serde_json::from_slice(payload).map_err(payload_error)?)
            }
            EventType::OrderPlaced => {
                Event::OrderPlaced(serde_json::from_slice(payload).map_err(payload_error)?)
            }
            EventType::PaymentSettled => {
                Event::PaymentSettled(serde_json::from_slice(payload).map_err(payload_error)?)
            }
            EventType::InventoryAdjusted => {
                let adjustment: InventoryAdjusted =
                    serde_json::from_slice(payload).map_err(payload_error)?;
                if adjustment.delta().is_none() {
                    return Err(DecodeError::QuantityOutOfRange {
                        event_type,
                        quantity: adjustment.quantity,
                    });
                }
                Event::InventoryAdjusted(adjustment)
            }
        };

        if event.key().is_empty() {
            return Err(DecodeError::EmptyKey {
                event_type,
                field: event.key_field(),
            });
        }

        Ok(event)
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Event::UserCreated(_) => EventType::UserCreated,
            Event::OrderPlaced(_) => EventType::OrderPlaced,
            Event::PaymentSettled(_) => EventType::PaymentSettled,
            Event::InventoryAdjusted(_) => EventType::InventoryAdjusted,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            Event::UserCreated(e) => &e.envelope,
            Event::OrderPlaced(e) => &e.envelope,
            Event::PaymentSettled(e) => &e.envelope,
            Event::InventoryAdjusted(e) => &e.envelope,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.envelope().event_id
    }

    /// The business key, used both as the partition key and as the upsert match.
    pub fn key(&self) -> &str {
        match self {
            Event::UserCreated(e) => &e.user_id,
            Event::OrderPlaced(e) => &e.order_id,
            Event::PaymentSettled(e) => &e.order_id,
            Event::InventoryAdjusted(e) => &e.sku,
        }
    }

    fn key_field(&self) -> &'static str {
        match self {
            Event::UserCreated(_) => "userId",
            Event::OrderPlaced(_) | Event::PaymentSettled(_) => "orderId",
            Event::InventoryAdjusted(_) => "sku",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Pull `eventId` out of a payload whose envelope failed to decode, if the
/// payload is at least a JSON object carrying a string id.
pub fn salvage_event_id(payload: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|value| value.get("eventId")?.as_str().map(str::to_owned))
        .unwrap_or_default()
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to parse event envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("failed to decode {event_type} event: {source}")]
    Payload {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },
    #[error("{event_type} event has an empty {field}")]
    EmptyKey {
        event_type: EventType,
        field: &'static str,
    },
    #[error("{event_type} event quantity {quantity} is out of range")]
    QuantityOutOfRange { event_type: EventType, quantity: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    fn user_created_json() -> serde_json::Value {
        json!({
            "eventId": "evt-1",
            "eventType": "UserCreated",
            "timestamp": "2024-06-01T10:00:00Z",
            "userId": "user-1",
            "email": "ada@example.com",
            "firstName": "Ada",
            "lastName": "Lovelace",
            "createdAt": "2024-06-01T09:59:00Z"
        })
    }

    #[test]
    fn event_type_names() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse(), Ok(event_type));
            assert_eq!(EventType::ALL[event_type.index()], event_type);
        }
        assert_eq!(
            "UserDeleted".parse::<EventType>(),
            Err(UnknownEventType("UserDeleted".to_owned()))
        );
    }

    #[test]
    fn decode_user_created() {
        let payload = serde_json::to_vec(&user_created_json()).unwrap();
        let event = Event::decode(&payload).expect("failed to decode");

        assert_eq!(event.event_type(), EventType::UserCreated);
        assert_eq!(event.event_id(), "evt-1");
        assert_eq!(event.key(), "user-1");
        let Event::UserCreated(user) = event else {
            panic!("wrong variant");
        };
        assert_eq!(user.first_name, "Ada");
    }

    #[test]
    fn business_keys() {
        let order = json!({
            "eventId": "evt-2",
            "eventType": "OrderPlaced",
            "timestamp": "2024-06-01T10:00:00Z",
            "orderId": "order-1",
            "userId": "user-1",
            "totalAmount": 12.5,
            "currency": "USD",
            "items": [{"sku": "SKU-1", "quantity": 2, "price": 6.25}],
            "placedAt": "2024-06-01T10:00:00Z"
        });
        let payment = json!({
            "eventId": "evt-3",
            "eventType": "PaymentSettled",
            "timestamp": "2024-06-01T10:00:00Z",
            "paymentId": "pay-1",
            "orderId": "order-1",
            "amount": 12.5,
            "currency": "USD",
            "paymentMethod": "card",
            "status": "settled",
            "settledAt": "2024-06-01T10:01:00Z"
        });
        let inventory = json!({
            "eventId": "evt-4",
            "eventType": "InventoryAdjusted",
            "timestamp": "2024-06-01T10:00:00Z",
            "sku": "SKU-1",
            "quantity": 5,
            "adjustmentType": "add",
            "adjustedAt": "2024-06-01T10:00:00Z"
        });

        let decode = |value: serde_json::Value| {
            Event::decode(&serde_json::to_vec(&value).unwrap()).expect("failed to decode")
        };
        assert_eq!(decode(order).key(), "order-1");
        assert_eq!(decode(payment).key(), "order-1");

        let inventory = decode(inventory);
        assert_eq!(inventory.key(), "SKU-1");
        let Event::InventoryAdjusted(adjustment) = inventory else {
            panic!("wrong variant");
        };
        assert_eq!(adjustment.reason, "");
    }

    #[test]
    fn unknown_event_type_keeps_name() {
        let payload = br#"{"eventId":"evt-9","eventType":"UserDeleted","timestamp":"2024-06-01T10:00:00Z"}"#;
        match Event::decode(payload) {
            Err(DecodeError::UnknownEventType(name)) => assert_eq!(name, "UserDeleted"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn invalid_json_fails_envelope() {
        assert!(matches!(
            Event::decode(b"{not json"),
            Err(DecodeError::Envelope(_))
        ));
        assert!(matches!(
            Event::decode(br#"{"eventId":"evt-1","eventType":"UserCreated","timestamp":"yesterday"}"#),
            Err(DecodeError::Envelope(_))
        ));
    }

    #[test]
    fn mistyped_field_fails_payload() {
        let mut value = user_created_json();
        value["email"] = json!(42);
        let payload = serde_json::to_vec(&value).unwrap();

        let err = Event::decode(&payload).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Payload {
                event_type: EventType::UserCreated,
                ..
            }
        ));
        assert!(err.to_string().starts_with("failed to decode UserCreated event"));
    }

    #[test]
    fn empty_business_key_is_rejected() {
        let mut value = user_created_json();
        value["userId"] = json!("");
        let payload = serde_json::to_vec(&value).unwrap();

        assert_eq!(
            Event::decode(&payload).unwrap_err().to_string(),
            "UserCreated event has an empty userId"
        );
    }

    #[test]
    fn inventory_delta_sign() {
        let mut adjustment = InventoryAdjusted {
            envelope: Envelope::new(EventType::InventoryAdjusted),
            sku: "SKU-1".to_owned(),
            quantity: 7,
            adjustment_type: "subtract".to_owned(),
            reason: "damaged".to_owned(),
            adjusted_at: Utc::now(),
        };
        assert_eq!(adjustment.delta(), Some(-7));

        adjustment.adjustment_type = "add".to_owned();
        assert_eq!(adjustment.delta(), Some(7));

        adjustment.adjustment_type = "returned".to_owned();
        adjustment.quantity = -50;
        assert_eq!(adjustment.delta(), Some(-50));

        adjustment.quantity = i64::MIN;
        assert_eq!(adjustment.delta(), Some(i64::MIN));
        adjustment.adjustment_type = "subtract".to_owned();
        assert_eq!(adjustment.delta(), None);
    }

    #[test]
    fn unnegatable_subtraction_is_rejected() {
        let payload = format!(
            r#"{{"eventId":"evt-5","eventType":"InventoryAdjusted","timestamp":"2024-06-01T10:00:00Z","sku":"SKU-1","quantity":{},"adjustmentType":"subtract","adjustedAt":"2024-06-01T10:00:00Z"}}"#,
            i64::MIN
        );

        let err = Event::decode(payload.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::QuantityOutOfRange {
                event_type: EventType::InventoryAdjusted,
                quantity: i64::MIN,
            }
        ));
        assert_eq!(
            err.to_string(),
            "InventoryAdjusted event quantity -9223372036854775808 is out of range"
        );
    }

    #[test]
    fn serialized_event_is_flat() {
        let payload = serde_json::to_vec(&user_created_json()).unwrap();
        let event = Event::decode(&payload).unwrap();
        let encoded: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_json_include!(
            actual: encoded,
            expected: json!({
                "eventId": "evt-1",
                "eventType": "UserCreated",
                "userId": "user-1",
                "firstName": "Ada"
            })
        );
    }

    #[test]
    fn salvage_event_id_from_partial_payload() {
        assert_eq!(salvage_event_id(br#"{"eventId":"evt-7","timestamp":"bad"}"#), "evt-7");
        assert_eq!(salvage_event_id(b"garbage"), "");
        assert_eq!(salvage_event_id(br#"{"eventId":17}"#), "");
    }
}
