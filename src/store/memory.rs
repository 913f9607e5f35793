//! In-memory message store.
//!
//! Keeps the full lifecycle state in process memory behind a single lock,
//! which makes claims trivially atomic. Useful for embedding and tests; the
//! SQLite store is the durable option.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::store::MessageStore;
use crate::types::{
    duration_to_chrono, Message, MessageId, QueueName, QueuedMessage, SortOrder, UpcomingDelivery,
};
use crate::Result;

/// In-memory [`MessageStore`].
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    messages: HashMap<String, StoredMessage>,
    next_seq: u64,
}

struct StoredMessage {
    snapshot: QueuedMessage,
    seq: u64,
    claimed_by: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claimed_by.is_some() && self.claim_expires_at.map(|at| at > now).unwrap_or(false)
    }

    fn release_claim(&mut self) {
        self.claimed_by = None;
        self.claim_expires_at = None;
    }
}

impl InMemoryMessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert_snapshot(
        &self,
        queue_name: &QueueName,
        message: &Message,
        next_delivery_at: DateTime<Utc>,
        total_attempts: u32,
        last_error: Option<String>,
        is_dead_letter: bool,
    ) -> MessageId {
        let id = MessageId::new();
        let snapshot = QueuedMessage {
            id: id.clone(),
            queue_name: queue_name.clone(),
            payload: message.payload.clone(),
            payload_type: message.payload_type.clone(),
            metadata: message.metadata.clone(),
            added_timestamp: Utc::now(),
            next_delivery_timestamp: next_delivery_at,
            total_delivery_attempts: total_attempts,
            redelivery_attempts: 0,
            last_delivery_error: last_error,
            is_dead_letter,
            ordering: message.ordering.clone(),
        };

        let mut inner = self.inner.write().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.messages.insert(
            id.0.clone(),
            StoredMessage {
                snapshot,
                seq,
                claimed_by: None,
                claim_expires_at: None,
            },
        );

        debug!(
            queue_name = %queue_name,
            message_id = %id,
            is_dead_letter = is_dead_letter,
            "Message inserted"
        );
        id
    }

    async fn list_with_dead_letter_flag(
        &self,
        queue_name: &QueueName,
        is_dead_letter: bool,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Vec<QueuedMessage> {
        let inner = self.inner.read().await;
        let mut matches: Vec<&StoredMessage> = inner
            .messages
            .values()
            .filter(|m| {
                m.snapshot.queue_name == *queue_name && m.snapshot.is_dead_letter == is_dead_letter
            })
            .collect();
        matches.sort_by_key(|m| {
            (
                m.snapshot.next_delivery_timestamp,
                m.snapshot.added_timestamp,
                m.seq,
            )
        });
        if order == SortOrder::Descending {
            matches.reverse();
        }

        matches
            .into_iter()
            .skip(skip as usize)
            .take(limit as usize)
            .map(|m| m.snapshot.clone())
            .collect()
    }
}

/// Whether a message with the same key and a lower `key_order` than the
/// candidate still exists, in any state.
fn has_earlier_sibling(messages: &HashMap<String, StoredMessage>, candidate: &QueuedMessage) -> bool {
    let Some(ordering) = &candidate.ordering else {
        return false;
    };
    messages.values().any(|other| {
        other.snapshot.queue_name == candidate.queue_name
            && other
                .snapshot
                .ordering
                .as_ref()
                .map(|o| o.key == ordering.key && o.key_order < ordering.key_order)
                .unwrap_or(false)
    })
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(
        &self,
        queue_name: &QueueName,
        message: &Message,
        delivery_delay: Option<Duration>,
    ) -> Result<MessageId> {
        let next_delivery_at = match delivery_delay {
            Some(delay) => Utc::now() + duration_to_chrono(delay),
            None => Utc::now(),
        };
        Ok(self
            .insert_snapshot(queue_name, message, next_delivery_at, 0, None, false)
            .await)
    }

    async fn insert_as_dead_letter(
        &self,
        queue_name: &QueueName,
        message: &Message,
        cause: &str,
    ) -> Result<MessageId> {
        Ok(self
            .insert_snapshot(
                queue_name,
                message,
                Utc::now(),
                1,
                Some(cause.to_string()),
                true,
            )
            .await)
    }

    async fn claim_next_due(
        &self,
        queue_name: &QueueName,
        claimed_by: &str,
        claim_timeout: Duration,
    ) -> Result<Option<QueuedMessage>> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let candidate_id = {
            let messages = &inner.messages;
            messages
                .values()
                .filter(|m| {
                    m.snapshot.queue_name == *queue_name
                        && !m.snapshot.is_dead_letter
                        && m.snapshot.next_delivery_timestamp <= now
                        && !m.is_claimed(now)
                        && !has_earlier_sibling(messages, &m.snapshot)
                })
                .min_by_key(|m| {
                    (
                        m.snapshot.next_delivery_timestamp,
                        m.snapshot.added_timestamp,
                        m.seq,
                    )
                })
                .map(|m| m.snapshot.id.0.clone())
        };

        Ok(candidate_id.map(|id| {
            let stored = inner
                .messages
                .get_mut(&id)
                .expect("candidate selected under the same lock");
            stored.claimed_by = Some(claimed_by.to_string());
            stored.claim_expires_at = Some(now + duration_to_chrono(claim_timeout));
            stored.snapshot.clone()
        }))
    }

    async fn ack(&self, id: &MessageId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.messages.remove(&id.0).is_none() {
            debug!(message_id = %id, "Acknowledge skipped, message already gone");
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: &MessageId,
        next_delivery_at: DateTime<Utc>,
        error: &str,
        increment_attempts: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .messages
            .get_mut(&id.0)
            .ok_or_else(|| crate::Error::MessageNotFound(id.to_string()))?;

        stored.snapshot.next_delivery_timestamp = next_delivery_at;
        stored.snapshot.last_delivery_error = Some(error.to_string());
        if increment_attempts {
            stored.snapshot.total_delivery_attempts += 1;
            stored.snapshot.redelivery_attempts += 1;
        }
        stored.release_claim();
        Ok(())
    }

    async fn mark_dead_letter(&self, id: &MessageId, error: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .messages
            .get_mut(&id.0)
            .ok_or_else(|| crate::Error::MessageNotFound(id.to_string()))?;

        stored.snapshot.is_dead_letter = true;
        stored.snapshot.last_delivery_error = Some(error.to_string());
        stored.snapshot.total_delivery_attempts += 1;
        stored.release_claim();

        info!(message_id = %id, "Message marked as dead letter");
        Ok(())
    }

    async fn resurrect(
        &self,
        id: &MessageId,
        delivery_delay: Duration,
    ) -> Result<Option<QueuedMessage>> {
        let mut inner = self.inner.write().await;
        let Some(stored) = inner.messages.get_mut(&id.0) else {
            return Ok(None);
        };
        if !stored.snapshot.is_dead_letter {
            return Ok(None);
        }

        stored.snapshot.is_dead_letter = false;
        stored.snapshot.next_delivery_timestamp = Utc::now() + duration_to_chrono(delivery_delay);
        stored.snapshot.redelivery_attempts = 0;
        stored.release_claim();

        info!(message_id = %id, "Dead letter resurrected");
        Ok(Some(stored.snapshot.clone()))
    }

    async fn get(&self, id: &MessageId) -> Result<Option<QueuedMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .get(&id.0)
            .filter(|m| !m.snapshot.is_dead_letter)
            .map(|m| m.snapshot.clone()))
    }

    async fn get_dead_letter(&self, id: &MessageId) -> Result<Option<QueuedMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .get(&id.0)
            .filter(|m| m.snapshot.is_dead_letter)
            .map(|m| m.snapshot.clone()))
    }

    async fn list_queued(
        &self,
        queue_name: &QueueName,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<QueuedMessage>> {
        Ok(self
            .list_with_dead_letter_flag(queue_name, false, order, skip, limit)
            .await)
    }

    async fn list_dead_letters(
        &self,
        queue_name: &QueueName,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<QueuedMessage>> {
        Ok(self
            .list_with_dead_letter_flag(queue_name, true, order, skip, limit)
            .await)
    }

    async fn count_queued(&self, queue_name: &QueueName) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .values()
            .filter(|m| m.snapshot.queue_name == *queue_name && !m.snapshot.is_dead_letter)
            .count() as u64)
    }

    async fn query_due_soon(
        &self,
        queue_name: &QueueName,
        ready_after: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<UpcomingDelivery>> {
        let inner = self.inner.read().await;
        let mut matches: Vec<&StoredMessage> = inner
            .messages
            .values()
            .filter(|m| {
                m.snapshot.queue_name == *queue_name
                    && !m.snapshot.is_dead_letter
                    && m.snapshot.next_delivery_timestamp >= ready_after
            })
            .collect();
        matches.sort_by_key(|m| {
            (
                m.snapshot.next_delivery_timestamp,
                m.snapshot.added_timestamp,
                m.seq,
            )
        });

        Ok(matches
            .into_iter()
            .take(limit as usize)
            .map(|m| UpcomingDelivery {
                id: m.snapshot.id.clone(),
                added_timestamp: m.snapshot.added_timestamp,
                next_delivery_timestamp: m.snapshot.next_delivery_timestamp,
            })
            .collect())
    }

    async fn purge(&self, queue_name: &QueueName) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let before = inner.messages.len();
        inner
            .messages
            .retain(|_, m| m.snapshot.queue_name != *queue_name || m.is_claimed(now));
        let deleted = (before - inner.messages.len()) as u64;

        info!(queue_name = %queue_name, messages_purged = deleted, "Queue purged");
        Ok(deleted)
    }

    async fn release_expired_claims(&self) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut released = 0u64;
        for stored in inner.messages.values_mut() {
            if stored.claimed_by.is_some() && !stored.is_claimed(now) {
                stored.release_claim();
                released += 1;
            }
        }

        if released > 0 {
            debug!(claims_released = released, "Released expired claims");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn queue() -> QueueName {
        QueueName::new("TestQueue").unwrap()
    }

    #[tokio::test]
    async fn test_claim_prefers_earliest_due() {
        let store = InMemoryMessageStore::new();
        let q = queue();

        let first = store
            .insert(&q, &Message::new(&"first").unwrap(), None)
            .await
            .unwrap();
        store
            .insert(
                &q,
                &Message::new(&"second").unwrap(),
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let claimed = store
            .claim_next_due(&q, "worker-0", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("due message should be claimable");
        assert_eq!(claimed.id, first);

        // The delayed message is not yet due.
        let next = store
            .claim_next_due(&q, "worker-0", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_claimed_message_is_invisible_until_expiry() {
        let store = InMemoryMessageStore::new();
        let q = queue();
        store
            .insert(&q, &Message::new(&"payload").unwrap(), None)
            .await
            .unwrap();

        let claimed = store
            .claim_next_due(&q, "worker-0", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(claimed.is_some());

        let stolen = store
            .claim_next_due(&q, "worker-1", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(stolen.is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let reclaimed = store
            .claim_next_due(&q, "worker-1", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(reclaimed.is_some());
    }

    #[tokio::test]
    async fn test_ordered_key_blocks_on_earlier_sibling() {
        let store = InMemoryMessageStore::new();
        let q = queue();

        // Later entry of the key is due, earlier one is not yet.
        store
            .insert(
                &q,
                &Message::ordered(&"early", "Key1", 0).unwrap(),
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        store
            .insert(&q, &Message::ordered(&"late", "Key1", 1).unwrap(), None)
            .await
            .unwrap();

        let claimed = store
            .claim_next_due(&q, "worker-0", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(claimed.is_none(), "later key entry must wait for earlier one");
    }

    #[tokio::test]
    async fn test_ordered_key_blocks_behind_dead_letter() {
        let store = InMemoryMessageStore::new();
        let q = queue();

        store
            .insert_as_dead_letter(&q, &Message::ordered(&"dead", "Key1", 0).unwrap(), "oops")
            .await
            .unwrap();
        store
            .insert(&q, &Message::ordered(&"blocked", "Key1", 1).unwrap(), None)
            .await
            .unwrap();

        let claimed = store
            .claim_next_due(&q, "worker-0", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_purge_spares_claimed_rows() {
        let store = InMemoryMessageStore::new();
        let q = queue();

        store
            .insert(&q, &Message::new(&"claimed").unwrap(), None)
            .await
            .unwrap();
        store
            .insert(&q, &Message::new(&"idle").unwrap(), None)
            .await
            .unwrap();

        store
            .claim_next_due(&q, "worker-0", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("claim should succeed");

        let deleted = store.purge(&q).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_queued(&q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_increments_counters() {
        let store = InMemoryMessageStore::new();
        let q = queue();
        let id = store
            .insert(&q, &Message::new(&"payload").unwrap(), None)
            .await
            .unwrap();

        store
            .claim_next_due(&q, "worker-0", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("claim should succeed");
        store
            .reschedule(&id, Utc::now(), "boom", true)
            .await
            .unwrap();

        let snapshot = store.get(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.total_delivery_attempts, 1);
        assert_eq!(snapshot.redelivery_attempts, 1);
        assert_eq!(snapshot.last_delivery_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_resurrect_resets_redeliveries_only() {
        let store = InMemoryMessageStore::new();
        let q = queue();
        let id = store
            .insert(&q, &Message::new(&"payload").unwrap(), None)
            .await
            .unwrap();

        store
            .reschedule(&id, Utc::now(), "first failure", true)
            .await
            .unwrap();
        store.mark_dead_letter(&id, "second failure").await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.get_dead_letter(&id).await.unwrap().is_some());

        let restored = store
            .resurrect(&id, Duration::from_millis(10))
            .await
            .unwrap()
            .expect("dead letter should be restorable");
        assert!(!restored.is_dead_letter);
        assert_eq!(restored.redelivery_attempts, 0);
        assert_eq!(restored.total_delivery_attempts, 2);

        // A second resurrect is a no-op.
        assert!(store
            .resurrect(&id, Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }
}
