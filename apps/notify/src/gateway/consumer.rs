//! Background queue consumption with bounded retry.
//!
//! One task per queue pulls deliveries and hands them to a handler. Success
//! acks. A retryable failure is nacked back onto the queue with its attempt
//! counter bumped, until the policy's limit, after which (or immediately, for
//! non-retryable failures) the delivery is parked on `<queue>:dead`. Handler
//! failures never stop the loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_common::id::prefix;
use parley_common::PrefixedId;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BrokerError, HandlerError};

/// How long one `receive` call blocks before the loop re-checks shutdown.
/// Bounds shutdown latency.
const RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// Pause after a broker error before trying again.
const BROKER_ERROR_BACKOFF: Duration = Duration::from_millis(500);

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}:dead")
}

/// One item pulled off a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    #[serde(skip)]
    pub queue: String,
    pub body: String,
    /// 1 on first delivery.
    pub attempt: u32,
}

impl PrefixedId for Delivery {
    const PREFIX: &'static str = prefix::DELIVERY;
}

impl Delivery {
    pub fn new(queue: &str, body: impl Into<String>) -> Self {
        Self {
            id: Self::generate(),
            queue: queue.to_string(),
            body: body.into(),
            attempt: 1,
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Wait up to `wait` for the next delivery on `queue`.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Give a delivery back. With `requeue` it returns to its queue as the
    /// next attempt, otherwise it goes to the dead-letter queue.
    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), BrokerError>;

    async fn enqueue(&self, queue: &str, body: &str) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Pause before a failed delivery is handed back.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, delivery: &Delivery, err: &HandlerError) -> bool {
        err.is_retryable() && delivery.attempt < self.max_attempts
    }
}

pub struct Consumer;

impl Consumer {
    /// Start consuming `queue` until `shutdown` fires.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        handler: Arc<dyn DeliveryHandler>,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = queue.into();
        tokio::spawn(async move {
            tracing::info!(queue = %queue, "consumer started");
            // Shutdown is checked between receives, never raced against one:
            // an item the broker already popped is always processed.
            while !shutdown.is_cancelled() {
                match broker.receive(&queue, RECEIVE_WAIT).await {
                    Ok(Some(delivery)) => {
                        process(broker.as_ref(), handler.as_ref(), &policy, &shutdown, delivery)
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(?e, queue = %queue, "receive failed, backing off");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(BROKER_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
            tracing::info!(queue = %queue, "consumer stopped");
        })
    }
}

async fn process(
    broker: &dyn Broker,
    handler: &dyn DeliveryHandler,
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    delivery: Delivery,
) {
    match handler.handle(&delivery).await {
        Ok(()) => {
            if let Err(e) = broker.ack(&delivery).await {
                tracing::error!(?e, delivery_id = %delivery.id, "ack failed");
            }
        }
        Err(err) if policy.should_retry(&delivery, &err) => {
            tracing::warn!(
                ?err,
                delivery_id = %delivery.id,
                attempt = delivery.attempt,
                max_attempts = policy.max_attempts,
                "delivery failed, requeueing"
            );
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(policy.backoff) => {}
            }
            let id = delivery.id.clone();
            if let Err(e) = broker.nack(delivery, true).await {
                tracing::error!(?e, delivery_id = %id, "requeue failed");
            }
        }
        Err(err) => {
            tracing::error!(
                ?err,
                delivery_id = %delivery.id,
                attempt = delivery.attempt,
                "delivery failed permanently, dead-lettering"
            );
            let id = delivery.id.clone();
            if let Err(e) = broker.nack(delivery, false).await {
                tracing::error!(?e, delivery_id = %id, "dead-lettering failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory broker (for tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<Delivery>>>,
    acked: Mutex<Vec<Delivery>>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acked(&self) -> Vec<Delivery> {
        self.acked.lock().clone()
    }

    /// Deliveries currently waiting on `queue` (dead-letter queues included).
    pub fn pending(&self, queue: &str) -> Vec<Delivery> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn push(&self, delivery: Delivery) {
        self.queues
            .lock()
            .entry(delivery.queue.clone())
            .or_default()
            .push_back(delivery);
        self.notify.notify_one();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let popped = self.queues.lock().get_mut(queue).and_then(VecDeque::pop_front);
            if popped.is_some() {
                return Ok(popped);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.acked.lock().push(delivery.clone());
        Ok(())
    }

    async fn nack(&self, mut delivery: Delivery, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            delivery.attempt += 1;
        } else {
            delivery.queue = dead_letter_queue(&delivery.queue);
        }
        self.push(delivery);
        Ok(())
    }

    async fn enqueue(&self, queue: &str, body: &str) -> Result<(), BrokerError> {
        self.push(Delivery::new(queue, body));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis list queue
// ---------------------------------------------------------------------------

/// Work queue on redis lists: producers LPUSH, the consumer BRPOPs.
///
/// Items are JSON `{id, body, attempt}`. Popping removes the item, so ack is
/// a no-op and a crash between pop and ack loses that delivery.
pub struct RedisQueue {
    /// Dedicated to BRPOP so blocking reads never stall other commands.
    blocking: ConnectionManager,
    conn: ConnectionManager,
}

impl RedisQueue {
    pub async fn connect(client: &redis::Client) -> Result<Self, BrokerError> {
        Ok(Self {
            blocking: ConnectionManager::new(client.clone()).await?,
            conn: ConnectionManager::new(client.clone()).await?,
        })
    }

    async fn push_raw(&self, queue: &str, item: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(queue, item).await?;
        Ok(())
    }

    async fn push(&self, queue: &str, delivery: &Delivery) -> Result<(), BrokerError> {
        let item = serde_json::to_string(delivery).map_err(|e| BrokerError::Malformed {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;
        self.push_raw(queue, &item).await
    }
}

#[async_trait]
impl Broker for RedisQueue {
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.blocking.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(queue)
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        let Some((_, item)) = popped else {
            return Ok(None);
        };
        match serde_json::from_str::<Delivery>(&item) {
            Ok(mut delivery) => {
                delivery.queue = queue.to_string();
                Ok(Some(delivery))
            }
            Err(e) => {
                // Park it where someone can look at it rather than lose it.
                self.push_raw(&dead_letter_queue(queue), &item).await?;
                Err(BrokerError::Malformed {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn nack(&self, mut delivery: Delivery, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            delivery.attempt += 1;
            let queue = delivery.queue.clone();
            self.push(&queue, &delivery).await
        } else {
            self.push(&dead_letter_queue(&delivery.queue), &delivery).await
        }
    }

    async fn enqueue(&self, queue: &str, body: &str) -> Result<(), BrokerError> {
        self.push(queue, &Delivery::new(queue, body)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FailFirst {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl DeliveryHandler for FailFirst {
        async fn handle(&self, _delivery: &Delivery) -> Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(HandlerError::Retryable("db hiccup".into()))
            } else {
                Ok(())
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn retries_then_acks() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = Arc::new(FailFirst {
            calls: AtomicUsize::new(0),
            failures: 2,
        });
        let shutdown = CancellationToken::new();
        let task = Consumer::spawn(broker.clone(), "q", handler.clone(), policy(5), shutdown.clone());

        broker.enqueue("q", "{}").await.unwrap();
        wait_for(|| broker.acked().len() == 1).await;

        assert_eq!(broker.acked()[0].attempt, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(broker.pending("q:dead").is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_attempts_go_to_dead_letter() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = Arc::new(FailFirst {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
        });
        let shutdown = CancellationToken::new();
        let task = Consumer::spawn(broker.clone(), "q", handler.clone(), policy(3), shutdown.clone());

        broker.enqueue("q", "{}").await.unwrap();
        wait_for(|| broker.pending("q:dead").len() == 1).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.pending("q:dead")[0].attempt, 3);
        assert!(broker.acked().is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    /// Pops from the inner broker only after a delay, like a BRPOP that
    /// returns while shutdown is being requested.
    struct SlowPop {
        inner: MemoryBroker,
        entered: Notify,
    }

    #[async_trait]
    impl Broker for SlowPop {
        async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.receive(queue, wait).await
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
            self.inner.ack(delivery).await
        }

        async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), BrokerError> {
            self.inner.nack(delivery, requeue).await
        }

        async fn enqueue(&self, queue: &str, body: &str) -> Result<(), BrokerError> {
            self.inner.enqueue(queue, body).await
        }
    }

    #[tokio::test]
    async fn shutdown_during_receive_still_processes_popped_item() {
        let broker = Arc::new(SlowPop {
            inner: MemoryBroker::new(),
            entered: Notify::new(),
        });
        broker.enqueue("q", "{}").await.unwrap();
        let handler = Arc::new(FailFirst {
            calls: AtomicUsize::new(0),
            failures: 0,
        });
        let shutdown = CancellationToken::new();
        let task = Consumer::spawn(broker.clone(), "q", handler.clone(), policy(3), shutdown.clone());

        broker.entered.notified().await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.inner.acked().len(), 1);
        assert!(broker.inner.pending("q").is_empty());
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let delivery = Delivery::new("q", "{");
        let err = HandlerError::Permanent("bad".into());
        assert!(!policy(5).should_retry(&delivery, &err));

        let err = HandlerError::Retryable("later".into());
        assert!(policy(5).should_retry(&delivery, &err));
        assert!(!policy(1).should_retry(&delivery, &err));
    }

    #[tokio::test]
    async fn receive_times_out_empty() {
        let broker = MemoryBroker::new();
        let got = broker.receive("q", Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
    }
}
