//! Queue consumers.
//!
//! A subscription runs a pool of independent workers that poll the store for
//! due messages, dispatch them to the handler and settle the outcome. Worker
//! failures never escape the loop: handler errors feed the redelivery policy,
//! store errors are logged and retried on the next poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DurableQueuesConfig, TransactionalMode};
use crate::notify::{QueueChangeNotifier, TableChangeOperation};
use crate::policy::RedeliveryPolicy;
use crate::polling::QueuePollingOptimizer;
use crate::store::MessageStore;
use crate::types::{duration_to_chrono, QueueName, QueuedMessage};
use crate::{Error, Result};

/// Default polling interval for consumers that do not override it.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(100);

/// Handles messages delivered by a queue consumer.
///
/// Returning `Ok` settles the message (in manual-acknowledgement mode the
/// handler must additionally acknowledge it); returning an error triggers the
/// redelivery policy.
#[async_trait]
pub trait QueuedMessageHandler: Send + Sync {
    /// Handle a single message.
    async fn handle(&self, message: QueuedMessage) -> anyhow::Result<()>;
}

/// Description of a queue subscription.
#[derive(Clone)]
pub struct ConsumeFromQueue {
    /// Queue to consume from.
    pub queue_name: QueueName,
    /// Redelivery policy applied to failing messages.
    pub redelivery_policy: RedeliveryPolicy,
    /// Number of independent workers.
    pub parallel_consumers: usize,
    /// Message handler shared by all workers.
    pub handler: Arc<dyn QueuedMessageHandler>,
    /// Base polling interval.
    pub polling_interval: Duration,
}

impl ConsumeFromQueue {
    /// Describe a subscription with the default polling interval.
    pub fn new(
        queue_name: QueueName,
        redelivery_policy: RedeliveryPolicy,
        parallel_consumers: usize,
        handler: Arc<dyn QueuedMessageHandler>,
    ) -> Self {
        Self {
            queue_name,
            redelivery_policy,
            parallel_consumers,
            handler,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }

    /// Override the base polling interval.
    pub fn with_polling_interval(mut self, polling_interval: Duration) -> Self {
        self.polling_interval = polling_interval;
        self
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does not stop the workers; call [`cancel`] or stop the
/// owning engine.
///
/// [`cancel`]: QueueConsumer::cancel
pub struct QueueConsumer {
    queue_name: QueueName,
    cancelled: AtomicBool,
    cancel_signal: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueConsumer {
    /// Queue this consumer is subscribed to.
    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    /// Whether the consumer has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel the subscription and wait for its workers to drain.
    ///
    /// No further claims are taken; in-flight deliveries run to completion.
    /// Cancelling more than once is harmless.
    pub async fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(queue_name = %self.queue_name, "Cancelling queue consumer");
        self.cancel_signal.notify_waiters();

        let workers = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
        info!(queue_name = %self.queue_name, "Queue consumer drained");
    }

    /// Spawn the subscription's workers and its wake listener.
    pub(crate) fn spawn(
        consume: ConsumeFromQueue,
        store: Arc<dyn MessageStore>,
        config: &DurableQueuesConfig,
        notifier: &QueueChangeNotifier,
    ) -> Result<Arc<Self>> {
        if consume.parallel_consumers == 0 {
            return Err(Error::Validation(
                crate::error::ValidationError::InvalidParameter {
                    name: "parallel_consumers".to_string(),
                    reason: "must be at least 1".to_string(),
                },
            ));
        }

        let consumer = Arc::new(Self {
            queue_name: consume.queue_name.clone(),
            cancelled: AtomicBool::new(false),
            cancel_signal: Notify::new(),
            workers: Mutex::new(Vec::new()),
        });

        let optimizer = Arc::new(QueuePollingOptimizer::new(
            consume.polling_interval,
            config.polling_delay_increment_factor,
            config.max_polling_interval,
        ));

        let mut handles = Vec::with_capacity(consume.parallel_consumers + 1);
        for index in 0..consume.parallel_consumers {
            let context = WorkerContext {
                consumer_name: format!("{}-consumer-{}", consume.queue_name, index),
                queue_name: consume.queue_name.clone(),
                store: store.clone(),
                handler: consume.handler.clone(),
                redelivery_policy: consume.redelivery_policy.clone(),
                optimizer: optimizer.clone(),
                consumer: consumer.clone(),
                transactional_mode: config.transactional_mode,
                message_handling_timeout: config.message_handling_timeout,
                verbose_tracing: config.verbose_tracing,
            };
            handles.push(tokio::spawn(worker_loop(context)));
        }
        handles.push(tokio::spawn(wake_listener(
            consumer.clone(),
            optimizer,
            notifier.subscribe(),
        )));

        *consumer.workers.try_lock().expect("no contention at spawn") = handles;

        info!(
            queue_name = %consume.queue_name,
            parallel_consumers = consume.parallel_consumers,
            "Queue consumer started"
        );
        Ok(consumer)
    }
}

struct WorkerContext {
    consumer_name: String,
    queue_name: QueueName,
    store: Arc<dyn MessageStore>,
    handler: Arc<dyn QueuedMessageHandler>,
    redelivery_policy: RedeliveryPolicy,
    optimizer: Arc<QueuePollingOptimizer>,
    consumer: Arc<QueueConsumer>,
    transactional_mode: TransactionalMode,
    message_handling_timeout: Duration,
    verbose_tracing: bool,
}

/// Forwards change notifications for the subscribed queue into polling
/// wake-ups. Lag on the broadcast channel only costs wake-ups, never
/// correctness, so it is logged and skipped.
async fn wake_listener(
    consumer: Arc<QueueConsumer>,
    optimizer: Arc<QueuePollingOptimizer>,
    mut events: tokio::sync::broadcast::Receiver<crate::notify::TableChangeNotification>,
) {
    loop {
        tokio::select! {
            _ = consumer.cancel_signal.notified() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if event.queue_name == consumer.queue_name.as_str()
                        && event.operation != TableChangeOperation::Delete
                    {
                        trace!(queue_name = %consumer.queue_name, "Waking pollers on table change");
                        optimizer.wake();
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        queue_name = %consumer.queue_name,
                        skipped_events = skipped,
                        "Change notification listener lagged, continuing with polling"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
        if consumer.is_cancelled() {
            break;
        }
    }
    debug!(queue_name = %consumer.queue_name, "Wake listener stopped");
}

async fn worker_loop(context: WorkerContext) {
    debug!(consumer = %context.consumer_name, "Worker started");

    while !context.consumer.is_cancelled() {
        let claimed = context
            .store
            .claim_next_due(
                &context.queue_name,
                &context.consumer_name,
                context.message_handling_timeout,
            )
            .await;

        match claimed {
            Ok(Some(message)) => {
                context.optimizer.register_hit();
                deliver(&context, message).await;
            }
            Ok(None) => {
                let interval = context.optimizer.register_miss();
                idle(&context, interval).await;
            }
            Err(e) => {
                warn!(
                    consumer = %context.consumer_name,
                    error = %e,
                    "Failed to poll for messages, retrying after interval"
                );
                idle(&context, context.optimizer.current_interval()).await;
            }
        }
    }

    debug!(consumer = %context.consumer_name, "Worker stopped");
}

/// Sleep until the polling interval elapses, a wake signal arrives or the
/// consumer is cancelled.
async fn idle(context: &WorkerContext, interval: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = context.optimizer.awoken() => {}
        _ = context.consumer.cancel_signal.notified() => {}
    }
}

async fn deliver(context: &WorkerContext, message: QueuedMessage) {
    let message_id = message.id.clone();
    let redelivery_attempts = message.redelivery_attempts;

    if context.verbose_tracing {
        trace!(
            consumer = %context.consumer_name,
            message_id = %message_id,
            total_delivery_attempts = message.total_delivery_attempts,
            redelivery_attempts = redelivery_attempts,
            "Dispatching message to handler"
        );
    }

    // Run the handler in its own task so a panic is contained as a failed
    // delivery instead of killing the worker.
    let handler = context.handler.clone();
    let outcome = match tokio::spawn(async move { handler.handle(message).await }).await {
        Ok(result) => result,
        Err(join_error) => Err(anyhow::anyhow!("Message handler panicked: {}", join_error)),
    };

    match outcome {
        Ok(()) => {
            if context.transactional_mode == TransactionalMode::ManualAcknowledgement {
                trace!(
                    consumer = %context.consumer_name,
                    message_id = %message_id,
                    "Handler finished, awaiting explicit acknowledgement"
                );
                return;
            }
            if let Err(e) = context.store.ack(&message_id).await {
                error!(
                    consumer = %context.consumer_name,
                    message_id = %message_id,
                    error = %e,
                    "Failed to acknowledge handled message, it may be redelivered"
                );
            }
        }
        Err(handler_error) => {
            let error_text = format!("{handler_error:#}");
            settle_failed_delivery(context, &message_id, redelivery_attempts, &error_text).await;
        }
    }
}

async fn settle_failed_delivery(
    context: &WorkerContext,
    message_id: &crate::types::MessageId,
    redelivery_attempts: u32,
    error_text: &str,
) {
    if context.redelivery_policy.is_exhausted(redelivery_attempts) {
        warn!(
            consumer = %context.consumer_name,
            message_id = %message_id,
            redelivery_attempts = redelivery_attempts,
            error = %error_text,
            "Redeliveries exhausted, marking message as dead letter"
        );
        if let Err(e) = context.store.mark_dead_letter(message_id, error_text).await {
            error!(
                consumer = %context.consumer_name,
                message_id = %message_id,
                error = %e,
                "Failed to mark message as dead letter"
            );
        }
        return;
    }

    let delay = context
        .redelivery_policy
        .delay_for_attempt(redelivery_attempts);
    let next_delivery_at = Utc::now() + duration_to_chrono(delay);
    debug!(
        consumer = %context.consumer_name,
        message_id = %message_id,
        redelivery_delay_millis = delay.as_millis() as u64,
        error = %error_text,
        "Handler failed, rescheduling message"
    );
    if let Err(e) = context
        .store
        .reschedule(message_id, next_delivery_at, error_text, true)
        .await
    {
        error!(
            consumer = %context.consumer_name,
            message_id = %message_id,
            error = %e,
            "Failed to reschedule message"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryMessageStore;
    use crate::types::Message;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        deliveries: AtomicU32,
    }

    #[async_trait]
    impl QueuedMessageHandler for CountingHandler {
        async fn handle(&self, _message: QueuedMessage) -> anyhow::Result<()> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn consume(queue: &QueueName, handler: Arc<dyn QueuedMessageHandler>) -> ConsumeFromQueue {
        ConsumeFromQueue::new(
            queue.clone(),
            RedeliveryPolicy::fixed_backoff(Duration::from_millis(200), 5),
            1,
            handler,
        )
        .with_polling_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_zero_parallel_consumers_rejected() {
        let queue = QueueName::new("TestQueue").unwrap();
        let handler = Arc::new(CountingHandler {
            deliveries: AtomicU32::new(0),
        });
        let mut request = consume(&queue, handler);
        request.parallel_consumers = 0;

        let result = QueueConsumer::spawn(
            request,
            Arc::new(InMemoryMessageStore::new()),
            &DurableQueuesConfig::default(),
            &QueueChangeNotifier::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_stops_claims() {
        let queue = QueueName::new("TestQueue").unwrap();
        let store = Arc::new(InMemoryMessageStore::new());
        let handler = Arc::new(CountingHandler {
            deliveries: AtomicU32::new(0),
        });

        let consumer = QueueConsumer::spawn(
            consume(&queue, handler.clone()),
            store.clone(),
            &DurableQueuesConfig::default(),
            &QueueChangeNotifier::new(),
        )
        .unwrap();

        consumer.cancel().await;
        consumer.cancel().await;
        assert!(consumer.is_cancelled());

        // Messages enqueued after cancellation stay untouched.
        store
            .insert(&queue, &Message::new(&"late").unwrap(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.deliveries.load(Ordering::SeqCst), 0);
        assert_eq!(store.count_queued(&queue).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_worker_delivers_and_acks() {
        let queue = QueueName::new("TestQueue").unwrap();
        let store = Arc::new(InMemoryMessageStore::new());
        let handler = Arc::new(CountingHandler {
            deliveries: AtomicU32::new(0),
        });

        store
            .insert(&queue, &Message::new(&"payload").unwrap(), None)
            .await
            .unwrap();

        let consumer = QueueConsumer::spawn(
            consume(&queue, handler.clone()),
            store.clone(),
            &DurableQueuesConfig::default(),
            &QueueChangeNotifier::new(),
        )
        .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while handler.deliveries.load(Ordering::SeqCst) == 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        consumer.cancel().await;
        assert_eq!(handler.deliveries.load(Ordering::SeqCst), 1);
        assert_eq!(store.count_queued(&queue).await.unwrap(), 0);
    }
}
