//! # durq - Durable SQL-backed Message Queue
//!
//! A durable message queue persisted in a single shared database table.
//! Producers enqueue messages (optionally delayed, optionally ordered per
//! key); consumer workers poll for due messages, claim them exclusively and
//! dispatch them to a handler with at-least-once semantics. Failing messages
//! are redelivered according to a configurable backoff policy and become dead
//! letters once redeliveries are exhausted; dead letters stay queryable and
//! can be explicitly resurrected.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use durq::engine::DurableQueues;
//! use durq::consumer::{ConsumeFromQueue, QueuedMessageHandler};
//! use durq::policy::RedeliveryPolicy;
//! use durq::store::sqlite::{SqliteMessageStore, SqliteStoreConfig};
//! use durq::types::{Message, QueueName, QueuedMessage};
//!
//! struct OrderHandler;
//!
//! #[async_trait::async_trait]
//! impl QueuedMessageHandler for OrderHandler {
//!     async fn handle(&self, message: QueuedMessage) -> anyhow::Result<()> {
//!         println!("handling {}", message.id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> durq::Result<()> {
//! let store = Arc::new(SqliteMessageStore::connect(SqliteStoreConfig::default()).await?);
//! let queues = DurableQueues::with_defaults(store)?;
//! queues.start();
//!
//! let queue = QueueName::new("orders")?;
//! queues.queue_message(&queue, Message::new(&"order placed")?, None).await?;
//!
//! let consumer = queues.consume_from_queue(ConsumeFromQueue::new(
//!     queue,
//!     RedeliveryPolicy::fixed_backoff(Duration::from_millis(200), 5),
//!     2,
//!     Arc::new(OrderHandler),
//! ))?;
//! # consumer.cancel().await;
//! # queues.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod notify;
pub mod policy;
pub mod polling;
pub mod store;
pub mod types;

pub use error::{Error, Result};
