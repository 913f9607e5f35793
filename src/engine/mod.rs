//! Durable queue engine.
//!
//! The facade producers and consumers interact with. It routes every
//! operation through the message store, publishes table change notifications
//! so idle consumers wake up promptly, owns the consumer registry and runs
//! the background sweep that releases expired delivery claims.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DurableQueuesConfig;
use crate::consumer::{ConsumeFromQueue, QueueConsumer};
use crate::notify::{QueueChangeNotifier, TableChangeNotification, TableChangeOperation};
use crate::store::MessageStore;
use crate::types::{
    Message, MessageId, QueueName, QueuedMessage, SortOrder, UpcomingDelivery,
};
use crate::Result;

/// Durable message queue engine.
pub struct DurableQueues {
    store: Arc<dyn MessageStore>,
    config: DurableQueuesConfig,
    notifier: QueueChangeNotifier,
    consumers: std::sync::Mutex<Vec<Arc<QueueConsumer>>>,
    started: AtomicBool,
    claim_sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DurableQueues {
    /// Create an engine over the given store.
    pub fn new(store: Arc<dyn MessageStore>, config: DurableQueuesConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            notifier: QueueChangeNotifier::new(),
            consumers: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            claim_sweeper: std::sync::Mutex::new(None),
        })
    }

    /// Create an engine with the default configuration.
    pub fn with_defaults(store: Arc<dyn MessageStore>) -> Result<Self> {
        Self::new(store, DurableQueuesConfig::default())
    }

    /// The engine configuration.
    pub fn config(&self) -> &DurableQueuesConfig {
        &self.config
    }

    /// Start the engine's background work. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting durable queue engine");

        let store = self.store.clone();
        let interval = self.config.claim_sweep_interval;
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.release_expired_claims().await {
                    Ok(released) if released > 0 => {
                        debug!(claims_released = released, "Claim sweep released expired claims");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Claim sweep failed"),
                }
            }
        });
        *self.claim_sweeper.lock().expect("claim sweeper lock poisoned") = Some(sweeper);
    }

    /// Stop the engine: cancel all consumers, wait for handler drain and stop
    /// background work. Idempotent.
    pub async fn stop(&self) {
        let was_started = self.started.swap(false, Ordering::SeqCst);
        let consumers = {
            let mut guard = self.consumers.lock().expect("consumer registry lock poisoned");
            std::mem::take(&mut *guard)
        };
        if !was_started && consumers.is_empty() {
            return;
        }
        info!("Stopping durable queue engine");
        for consumer in consumers {
            if tokio::time::timeout(self.config.drain_timeout, consumer.cancel())
                .await
                .is_err()
            {
                warn!(
                    queue_name = %consumer.queue_name(),
                    drain_timeout_millis = self.config.drain_timeout.as_millis() as u64,
                    "Consumer did not drain within the timeout, detaching; \
                     in-flight claims will expire"
                );
            }
        }

        if let Some(sweeper) = self
            .claim_sweeper
            .lock()
            .expect("claim sweeper lock poisoned")
            .take()
        {
            sweeper.abort();
        }
        info!("Durable queue engine stopped");
    }

    /// Enqueue a message, optionally delaying its first delivery.
    pub async fn queue_message(
        &self,
        queue_name: &QueueName,
        message: Message,
        delivery_delay: Option<Duration>,
    ) -> Result<MessageId> {
        let id = self.store.insert(queue_name, &message, delivery_delay).await?;
        if self.config.verbose_tracing {
            debug!(queue_name = %queue_name, message_id = %id, "Message queued");
        }
        self.publish_change(TableChangeOperation::Insert, &id, queue_name);
        Ok(id)
    }

    /// Enqueue a message directly as a dead letter.
    pub async fn queue_message_as_dead_letter(
        &self,
        queue_name: &QueueName,
        message: Message,
        cause: &str,
    ) -> Result<MessageId> {
        let id = self
            .store
            .insert_as_dead_letter(queue_name, &message, cause)
            .await?;
        if self.config.verbose_tracing {
            debug!(
                queue_name = %queue_name,
                message_id = %id,
                cause = %cause,
                "Message queued as dead letter"
            );
        }
        Ok(id)
    }

    /// Subscribe to a queue. Returns a handle that can cancel the
    /// subscription; the engine also cancels it on [`stop`](Self::stop).
    pub fn consume_from_queue(&self, consume: ConsumeFromQueue) -> Result<Arc<QueueConsumer>> {
        let consumer =
            QueueConsumer::spawn(consume, self.store.clone(), &self.config, &self.notifier)?;
        self.consumers
            .lock()
            .expect("consumer registry lock poisoned")
            .push(consumer.clone());
        Ok(consumer)
    }

    /// Fetch a queued (non-dead-letter) message by ID.
    pub async fn get_queued_message(&self, id: &MessageId) -> Result<Option<QueuedMessage>> {
        self.store.get(id).await
    }

    /// Fetch a dead letter by ID.
    pub async fn get_dead_letter_message(&self, id: &MessageId) -> Result<Option<QueuedMessage>> {
        self.store.get_dead_letter(id).await
    }

    /// Number of queued messages on the queue. Dead letters are not counted.
    pub async fn total_messages_queued_for(&self, queue_name: &QueueName) -> Result<u64> {
        self.store.count_queued(queue_name).await
    }

    /// List queued messages.
    pub async fn get_queued_messages(
        &self,
        queue_name: &QueueName,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<QueuedMessage>> {
        self.store.list_queued(queue_name, order, skip, limit).await
    }

    /// List dead letters.
    pub async fn get_dead_letter_messages(
        &self,
        queue_name: &QueueName,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<QueuedMessage>> {
        self.store
            .list_dead_letters(queue_name, order, skip, limit)
            .await
    }

    /// List upcoming deliveries due at or after `ready_after`.
    pub async fn query_for_messages_soon_ready_for_delivery(
        &self,
        queue_name: &QueueName,
        ready_after: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<UpcomingDelivery>> {
        self.store.query_due_soon(queue_name, ready_after, limit).await
    }

    /// Acknowledge a delivered message.
    ///
    /// Required in manual-acknowledgement mode, where the engine leaves
    /// settling to the handler; must happen before the message handling
    /// timeout elapses or the message becomes claimable again.
    pub async fn acknowledge_message_as_handled(&self, id: &MessageId) -> Result<()> {
        self.store.ack(id).await
    }

    /// Bring a dead letter back into rotation, due after `delivery_delay`.
    ///
    /// Returns the restored snapshot, or `None` if the ID does not refer to a
    /// dead letter.
    pub async fn resurrect_dead_letter_message(
        &self,
        id: &MessageId,
        delivery_delay: Duration,
    ) -> Result<Option<QueuedMessage>> {
        let restored = self.store.resurrect(id, delivery_delay).await?;
        if let Some(snapshot) = &restored {
            self.publish_change(TableChangeOperation::Update, id, &snapshot.queue_name);
        }
        Ok(restored)
    }

    /// Delete every unclaimed message of the queue, dead letters included.
    /// Returns the number of deleted messages.
    pub async fn purge_queue(&self, queue_name: &QueueName) -> Result<u64> {
        self.store.purge(queue_name).await
    }

    fn publish_change(
        &self,
        operation: TableChangeOperation,
        id: &MessageId,
        queue_name: &QueueName,
    ) {
        self.notifier.publish(TableChangeNotification {
            table: self.config.shared_queue_table_name.clone(),
            operation,
            id: id.0.clone(),
            queue_name: queue_name.as_str().to_string(),
        });
    }
}

impl Drop for DurableQueues {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.claim_sweeper.lock() {
            if let Some(sweeper) = guard.take() {
                sweeper.abort();
            }
        }
        if self.started.load(Ordering::SeqCst) {
            error!("Durable queue engine dropped without stop(), consumers are detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryMessageStore;

    fn engine() -> DurableQueues {
        DurableQueues::with_defaults(Arc::new(InMemoryMessageStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_queue_message_returns_snapshot_with_fresh_counters() {
        let engine = engine();
        let queue = QueueName::new("TestQueue").unwrap();

        let id = engine
            .queue_message(
                &queue,
                Message::new(&"payload").unwrap(),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let snapshot = engine.get_queued_message(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.total_delivery_attempts, 0);
        assert_eq!(snapshot.redelivery_attempts, 0);
        assert!(!snapshot.is_dead_letter);
        assert!(snapshot.last_delivery_error.is_none());
        assert!(snapshot.next_delivery_timestamp > snapshot.added_timestamp);
    }

    #[tokio::test]
    async fn test_enqueue_publishes_insert_event() {
        let engine = engine();
        let queue = QueueName::new("TestQueue").unwrap();
        let mut events = engine.notifier.subscribe();

        let id = engine
            .queue_message(&queue, Message::new(&"payload").unwrap(), None)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.operation, TableChangeOperation::Insert);
        assert_eq!(event.id, id.0);
        assert_eq!(event.queue_name, "TestQueue");
        assert_eq!(event.table, engine.config().shared_queue_table_name);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let engine = engine();
        engine.start();
        engine.start();
        engine.stop().await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_dead_letter_enqueue_is_not_counted() {
        let engine = engine();
        let queue = QueueName::new("TestQueue").unwrap();

        let id = engine
            .queue_message_as_dead_letter(&queue, Message::new(&"payload").unwrap(), "On purpose")
            .await
            .unwrap();

        assert_eq!(engine.total_messages_queued_for(&queue).await.unwrap(), 0);
        let dead = engine.get_dead_letter_message(&id).await.unwrap().unwrap();
        assert!(dead.is_dead_letter);
        assert_eq!(dead.total_delivery_attempts, 1);
        assert_eq!(dead.last_delivery_error.as_deref(), Some("On purpose"));
    }
}
