//! Common data types for durq.

pub mod validation;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::Result;

/// Unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }

    /// Create a message ID from a string.
    pub fn from_string(s: String) -> Self {
        MessageId(s)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create a validated queue name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validation::validate_queue_name(&name)?;
        Ok(QueueName(name))
    }

    /// The queue name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        validation::validate_queue_name(&value)?;
        Ok(QueueName(value))
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message metadata (correlation ids, trace ids and similar).
pub type MessageMetadata = HashMap<String, String>;

/// Per-key ordering constraint carried by an ordered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOrder {
    /// Ordering key; all messages sharing a key on the same queue are
    /// delivered in ascending `key_order`.
    pub key: String,
    /// Position within the key; lower means earlier.
    pub key_order: i64,
}

/// Listing sort order for queued and dead-letter messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Oldest due first.
    Ascending,
    /// Newest due first.
    Descending,
}

/// A message to be enqueued.
///
/// The payload is captured as a JSON value together with a type tag so the
/// consuming side can dispatch on the concrete type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Payload value.
    pub payload: serde_json::Value,
    /// Type tag describing the payload.
    pub payload_type: String,
    /// Metadata carried alongside the payload.
    pub metadata: MessageMetadata,
    /// Ordering constraint; `None` for normal messages.
    pub ordering: Option<MessageOrder>,
}

impl Message {
    /// Create a normal message from a serializable payload.
    pub fn new<T: Serialize>(payload: &T) -> Result<Self> {
        Ok(Self {
            payload: serde_json::to_value(payload)?,
            payload_type: std::any::type_name::<T>().to_string(),
            metadata: MessageMetadata::new(),
            ordering: None,
        })
    }

    /// Create an ordered message from a serializable payload.
    ///
    /// Messages sharing `key` on the same queue are delivered strictly in
    /// ascending `key_order`.
    pub fn ordered<T: Serialize>(payload: &T, key: impl Into<String>, key_order: i64) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(ValidationError::EmptyOrderingKey.into());
        }
        Ok(Self {
            ordering: Some(MessageOrder { key, key_order }),
            ..Self::new(payload)?
        })
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Snapshot of a persisted message as seen by consumers and queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique message ID.
    pub id: MessageId,
    /// Queue the message belongs to.
    pub queue_name: QueueName,
    /// Payload value.
    pub payload: serde_json::Value,
    /// Type tag describing the payload.
    pub payload_type: String,
    /// Metadata carried alongside the payload.
    pub metadata: MessageMetadata,
    /// Instant of enqueue.
    pub added_timestamp: DateTime<Utc>,
    /// Earliest instant at which delivery may be attempted.
    pub next_delivery_timestamp: DateTime<Utc>,
    /// Total number of delivery attempts that reached the handler.
    pub total_delivery_attempts: u32,
    /// Number of attempts after the first.
    pub redelivery_attempts: u32,
    /// Failure description of the last attempt, if any.
    pub last_delivery_error: Option<String>,
    /// Whether the message is a dead letter.
    pub is_dead_letter: bool,
    /// Ordering constraint; `None` for normal messages.
    pub ordering: Option<MessageOrder>,
}

impl QueuedMessage {
    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Lightweight record returned by the due-soon query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingDelivery {
    /// Message ID.
    pub id: MessageId,
    /// Instant of enqueue.
    pub added_timestamp: DateTime<Utc>,
    /// Earliest instant at which delivery may be attempted.
    pub next_delivery_timestamp: DateTime<Utc>,
}

pub(crate) fn timestamp_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn timestamp_from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| crate::Error::Internal(format!("Invalid timestamp: {}", micros)))
}

pub(crate) fn duration_to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::microseconds(duration.as_micros().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_new_is_unique() {
        let id1 = MessageId::new();
        let id2 = MessageId::new();

        assert_ne!(id1, id2);
        assert_eq!(id1.0.len(), 36);
    }

    #[test]
    fn test_message_id_display() {
        let id = MessageId::from_string("msg-1".to_string());
        assert_eq!(format!("{}", id), "msg-1");
    }

    #[test]
    fn test_queue_name_rejects_empty() {
        assert!(QueueName::new("").is_err());
        assert!(QueueName::new("TestQueue").is_ok());
    }

    #[test]
    fn test_message_new_captures_type_tag() {
        let message = Message::new(&42u32).unwrap();
        assert_eq!(message.payload, serde_json::json!(42));
        assert_eq!(message.payload_type, "u32");
        assert!(message.ordering.is_none());
    }

    #[test]
    fn test_ordered_message_requires_key() {
        assert!(Message::ordered(&"payload", "", 0).is_err());

        let message = Message::ordered(&"payload", "Key1", 3).unwrap();
        let ordering = message.ordering.unwrap();
        assert_eq!(ordering.key, "Key1");
        assert_eq!(ordering.key_order, 3);
    }

    #[test]
    fn test_with_metadata() {
        let message = Message::new(&"payload")
            .unwrap()
            .with_metadata("correlation_id", "abc")
            .with_metadata("trace_id", "def");

        assert_eq!(message.metadata.get("correlation_id").unwrap(), "abc");
        assert_eq!(message.metadata.get("trace_id").unwrap(), "def");
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let now = Utc::now();
        let micros = timestamp_micros(now);
        let restored = timestamp_from_micros(micros).unwrap();
        assert_eq!(restored.timestamp_micros(), now.timestamp_micros());
    }
}
