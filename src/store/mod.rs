//! Message store traits and implementations.
//!
//! The store is the single source of truth for message state. It persists
//! every lifecycle field and provides the atomic claim primitive consumers
//! use to take exclusive delivery ownership of a due message.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::types::{Message, MessageId, QueueName, QueuedMessage, SortOrder, UpcomingDelivery};
use crate::Result;
use async_trait::async_trait;

pub mod memory;
pub mod sqlite;

/// Durable message store.
///
/// Claims are leases: a claimed row stays invisible to other claimers until
/// it is settled (acknowledged, rescheduled or dead-lettered) or its claim
/// expires, at which point it becomes claimable again.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message. Delivery is delayed by `delivery_delay` when given,
    /// otherwise the message is due immediately.
    async fn insert(
        &self,
        queue_name: &QueueName,
        message: &Message,
        delivery_delay: Option<Duration>,
    ) -> Result<MessageId>;

    /// Insert a message directly as a dead letter with the given cause.
    ///
    /// The stored record carries one delivery attempt, mirroring a message
    /// that failed on its first delivery.
    async fn insert_as_dead_letter(
        &self,
        queue_name: &QueueName,
        message: &Message,
        cause: &str,
    ) -> Result<MessageId>;

    /// Atomically claim the single most eligible due message of the queue.
    ///
    /// Eligible means: not a dead letter, due, not claimed (or the claim has
    /// expired) and, for ordered messages, no message with the same key and a
    /// lower `key_order` still exists. Selection prefers the earliest
    /// `next_delivery_timestamp`, then the earliest enqueue.
    ///
    /// Returns `None` when nothing is eligible; concurrent claim races never
    /// surface as errors.
    async fn claim_next_due(
        &self,
        queue_name: &QueueName,
        claimed_by: &str,
        claim_timeout: Duration,
    ) -> Result<Option<QueuedMessage>>;

    /// Delete a settled message. Deleting an absent row is not an error.
    async fn ack(&self, id: &MessageId) -> Result<()>;

    /// Reschedule a message for a later delivery attempt and release its
    /// claim. When `increment_attempts` is set, the delivery and redelivery
    /// counters grow by one.
    async fn reschedule(
        &self,
        id: &MessageId,
        next_delivery_at: DateTime<Utc>,
        error: &str,
        increment_attempts: bool,
    ) -> Result<()>;

    /// Mark a message as a dead letter and release its claim. The failed
    /// attempt that caused the transition is counted.
    async fn mark_dead_letter(&self, id: &MessageId, error: &str) -> Result<()>;

    /// Bring a dead letter back into rotation, due after `delivery_delay`.
    ///
    /// The redelivery counter restarts at zero; the total delivery counter is
    /// kept as a historical record. Returns the restored snapshot, or `None`
    /// if the ID does not refer to a dead letter.
    async fn resurrect(
        &self,
        id: &MessageId,
        delivery_delay: Duration,
    ) -> Result<Option<QueuedMessage>>;

    /// Fetch a queued (non-dead-letter) message by ID.
    async fn get(&self, id: &MessageId) -> Result<Option<QueuedMessage>>;

    /// Fetch a dead letter by ID.
    async fn get_dead_letter(&self, id: &MessageId) -> Result<Option<QueuedMessage>>;

    /// List queued (non-dead-letter) messages of a queue.
    async fn list_queued(
        &self,
        queue_name: &QueueName,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<QueuedMessage>>;

    /// List dead letters of a queue.
    async fn list_dead_letters(
        &self,
        queue_name: &QueueName,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<QueuedMessage>>;

    /// Count queued (non-dead-letter) messages of a queue.
    async fn count_queued(&self, queue_name: &QueueName) -> Result<u64>;

    /// List upcoming deliveries whose `next_delivery_timestamp` is at or
    /// after `ready_after`, in ascending due order.
    async fn query_due_soon(
        &self,
        queue_name: &QueueName,
        ready_after: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<UpcomingDelivery>>;

    /// Delete every unclaimed record of the queue, dead letters included.
    /// Claimed rows are left for their holders to settle. Returns the number
    /// of deleted rows.
    async fn purge(&self, queue_name: &QueueName) -> Result<u64>;

    /// Release every expired claim so the affected messages re-enter the
    /// ready state. Returns the number of released claims.
    async fn release_expired_claims(&self) -> Result<u64>;
}
