//! In-process broker.
//!
//! # Responsibilities
//! - Named queues shared by any number of consumers
//! - Prefetch-bounded consumption with explicit ack/nack
//! - Private reply channels modelled on the direct reply-to pseudo-queue
//! - Fault injection for tests (publish failures, connection loss)
//!
//! # Design Decisions
//! - At-least-once: a delivery dropped without settlement goes back on its queue
//! - Publishing to an unknown queue silently drops the message, as the AMQP
//!   default exchange does for unroutable messages
//! - After `close()` every operation fails with `BrokerError::Closed` and all
//!   streams end

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};

use crate::broker::{
    Acknowledge, Broker, BrokerError, BrokerResult, Delivery, DeliveryStream, ReplyChannel,
    Settlement, DIRECT_REPLY_TO,
};
use crate::rpc::envelope::Envelope;

struct Message {
    envelope: Envelope,
    redelivered: bool,
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    unroutable: AtomicU64,
}

/// Snapshot of broker activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub unroutable: u64,
}

struct Inner {
    queues: DashMap<String, Arc<MemoryQueue>>,
    publish_faults: DashMap<String, u32>,
    closed: watch::Sender<bool>,
    reply_seq: AtomicU64,
    counters: Counters,
}

/// Broker living entirely inside the current process.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queues: DashMap::new(),
                publish_faults: DashMap::new(),
                closed,
                reply_seq: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Simulate loss of the broker connection.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Make the next `count` publishes to `routing_key` fail.
    pub fn fail_next_publishes(&self, routing_key: &str, count: u32) {
        self.inner.publish_faults.insert(routing_key.to_owned(), count);
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            unroutable: c.unroutable.load(Ordering::Relaxed),
        }
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.inner.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    fn take_fault(&self, routing_key: &str) -> bool {
        match self.inner.publish_faults.get_mut(routing_key) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn subscribe(&self, queue: Arc<MemoryQueue>) -> Subscription {
        Subscription {
            queue,
            closed: self.inner.closed.subscribe(),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of one queue, ending when the broker closes.
struct Subscription {
    queue: Arc<MemoryQueue>,
    closed: watch::Receiver<bool>,
}

impl Subscription {
    async fn next_message(&mut self) -> Option<Message> {
        if *self.closed.borrow() {
            return None;
        }
        let mut rx = self.queue.rx.lock().await;
        tokio::select! {
            message = rx.recv() => message,
            _ = self.closed.changed() => None,
        }
    }

    async fn acquire(&mut self, permits: &Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        if *self.closed.borrow() {
            return None;
        }
        tokio::select! {
            permit = Arc::clone(permits).acquire_owned() => permit.ok(),
            _ = self.closed.changed() => None,
        }
    }
}

struct Consumer {
    broker: InMemoryBroker,
    subscription: Subscription,
    permits: Arc<Semaphore>,
}

/// Removes a reply queue once nobody listens on it any more.
struct ReplyQueueGuard {
    broker: InMemoryBroker,
    name: String,
}

impl Drop for ReplyQueueGuard {
    fn drop(&mut self) {
        self.broker.inner.queues.remove(&self.name);
    }
}

struct ReplyListener {
    subscription: Subscription,
    _guard: ReplyQueueGuard,
}

struct MemoryAcker {
    broker: InMemoryBroker,
    requeue: mpsc::UnboundedSender<Message>,
    message: Option<Message>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn put_back(&self, mut message: Message) {
        message.redelivered = true;
        if self.requeue.send(message).is_ok() {
            self.broker.inner.counters.requeued.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(self: Box<Self>) -> BrokerResult<()> {
        let mut this = self;
        this.broker.ensure_open()?;
        this.message.take();
        this.broker.inner.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> BrokerResult<()> {
        let mut this = self;
        this.broker.ensure_open()?;
        if let Some(message) = this.message.take() {
            if requeue {
                this.put_back(message);
            } else {
                this.broker.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.put_back(message);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        self.inner
            .queues
            .entry(queue.to_owned())
            .or_insert_with(|| Arc::new(MemoryQueue::new()));
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: Envelope) -> BrokerResult<()> {
        self.ensure_open()?;
        if self.take_fault(routing_key) {
            return Err(BrokerError::Publish {
                routing_key: routing_key.to_owned(),
                reason: "injected publish fault".to_string(),
            });
        }

        match self.queue(routing_key) {
            Some(queue) => {
                let _ = queue.tx.send(Message {
                    envelope,
                    redelivered: false,
                });
                self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                tracing::debug!(routing_key = %routing_key, "Dropping unroutable message");
                self.inner.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;
        let source = self.queue(queue).ok_or_else(|| BrokerError::Consume {
            queue: queue.to_owned(),
            reason: "no such queue".to_string(),
        })?;

        let consumer = Consumer {
            broker: self.clone(),
            subscription: self.subscribe(source),
            permits: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
        };

        let deliveries = stream::unfold(consumer, |mut consumer| async move {
            let permit = consumer.subscription.acquire(&consumer.permits).await?;
            let message = consumer.subscription.next_message().await?;
            consumer
                .broker
                .inner
                .counters
                .delivered
                .fetch_add(1, Ordering::Relaxed);

            let delivery = Delivery {
                envelope: message.envelope.clone(),
                redelivered: message.redelivered,
                settlement: Settlement::new(MemoryAcker {
                    broker: consumer.broker.clone(),
                    requeue: consumer.subscription.queue.tx.clone(),
                    message: Some(message),
                    _permit: permit,
                }),
            };
            Some((Ok(delivery), consumer))
        });

        Ok(deliveries.boxed())
    }

    async fn open_reply_channel(&self) -> BrokerResult<ReplyChannel> {
        self.ensure_open()?;
        let seq = self.inner.reply_seq.fetch_add(1, Ordering::Relaxed);
        let target = format!("{}.{}", DIRECT_REPLY_TO, seq);
        let queue = Arc::new(MemoryQueue::new());
        self.inner.queues.insert(target.clone(), Arc::clone(&queue));

        let listener = ReplyListener {
            subscription: self.subscribe(queue),
            _guard: ReplyQueueGuard {
                broker: self.clone(),
                name: target.clone(),
            },
        };

        let replies = stream::unfold(listener, |mut listener| async move {
            let message = listener.subscription.next_message().await?;
            Some((message.envelope, listener))
        });

        Ok(ReplyChannel {
            target,
            replies: replies.boxed(),
        })
    }

    async fn connection_lost(&self) -> BrokerError {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
        BrokerError::Closed
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
