//! Table change notifications.
//!
//! An in-process publish/subscribe channel keyed by the shared queue table.
//! The engine publishes an event whenever a row is inserted, updated or
//! deleted through its public operations; subscriptions listen for events on
//! their queue and convert them into polling wake-ups. Losing events is
//! harmless: consumers degrade to pure polling.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Kind of row change carried by a [`TableChangeNotification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableChangeOperation {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// A change event for a single row of the shared queue table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChangeNotification {
    /// Table the change happened on.
    pub table: String,
    /// Kind of change.
    pub operation: TableChangeOperation,
    /// ID of the affected message.
    pub id: String,
    /// Queue the affected message belongs to.
    pub queue_name: String,
}

/// Broadcast channel for [`TableChangeNotification`]s.
#[derive(Clone)]
pub struct QueueChangeNotifier {
    sender: broadcast::Sender<TableChangeNotification>,
}

const CHANNEL_CAPACITY: usize = 256;

impl QueueChangeNotifier {
    /// Create a new notifier.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish a change event. Events published while nobody subscribes are
    /// dropped.
    pub fn publish(&self, notification: TableChangeNotification) {
        trace!(
            table = %notification.table,
            operation = ?notification.operation,
            queue_name = %notification.queue_name,
            "Publishing table change notification"
        );
        let _ = self.sender.send(notification);
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<TableChangeNotification> {
        self.sender.subscribe()
    }
}

impl Default for QueueChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_event(queue: &str) -> TableChangeNotification {
        TableChangeNotification {
            table: "durable_queue_messages".to_string(),
            operation: TableChangeOperation::Insert,
            id: "msg-1".to_string(),
            queue_name: queue.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let notifier = QueueChangeNotifier::new();
        let mut rx1 = notifier.subscribe();
        let mut rx2 = notifier.subscribe();

        notifier.publish(insert_event("TestQueue"));

        assert_eq!(rx1.recv().await.unwrap().queue_name, "TestQueue");
        assert_eq!(rx2.recv().await.unwrap().queue_name, "TestQueue");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let notifier = QueueChangeNotifier::new();
        notifier.publish(insert_event("TestQueue"));
    }

    #[test]
    fn test_event_json_shape() {
        let event = insert_event("TestQueue");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "table": "durable_queue_messages",
                "operation": "insert",
                "id": "msg-1",
                "queue_name": "TestQueue",
            })
        );
    }
}
