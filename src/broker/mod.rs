//! Message broker subsystem.
//!
//! # Data Flow
//! ```text
//! RPC client:
//!     open_reply_channel() → listener task → correlator
//!     publish(command queue, request envelope)
//!
//! RPC server:
//!     declare_queue(inbound) → consume(inbound, prefetch)
//!     → Delivery → publish(reply target, reply envelope) → ack
//! ```
//!
//! # Design Decisions
//! - One trait covers both sides; implementations own their channels
//! - Deliveries are settled explicitly; an unsettled delivery is redelivered
//! - `AmqpBroker` talks to RabbitMQ, `InMemoryBroker` runs in-process

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::rpc::envelope::Envelope;

pub use amqp::AmqpBroker;
pub use memory::{BrokerStats, InMemoryBroker};

/// RabbitMQ's built-in direct reply-to pseudo-queue.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Errors raised by broker implementations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("broker connection closed")]
    Closed,

    #[error("failed to declare queue `{queue}`: {reason}")]
    Declare { queue: String, reason: String },

    #[error("failed to publish to `{routing_key}`: {reason}")]
    Publish { routing_key: String, reason: String },

    #[error("failed to consume from `{queue}`: {reason}")]
    Consume { queue: String, reason: String },

    #[error("failed to settle delivery: {0}")]
    Settle(String),
}

impl BrokerError {
    /// True when the connection itself is gone and nothing else can be done on it.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::Connect(_) | BrokerError::Closed)
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Stream of command deliveries from one consumer.
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Stream of replies arriving on a reply channel. Ends when the channel dies.
pub type ReplyStream = BoxStream<'static, Envelope>;

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> BrokerResult<()>;
    async fn nack(self: Box<Self>, requeue: bool) -> BrokerResult<()>;
}

/// Settlement handle detached from the envelope it belongs to.
pub struct Settlement {
    inner: Box<dyn Acknowledge>,
}

impl Settlement {
    pub fn new(acker: impl Acknowledge + 'static) -> Self {
        Self {
            inner: Box::new(acker),
        }
    }

    /// Confirm consumption; the broker forgets the message.
    pub async fn ack(self) -> BrokerResult<()> {
        self.inner.ack().await
    }

    /// Reject the message, optionally putting it back on its queue.
    pub async fn nack(self, requeue: bool) -> BrokerResult<()> {
        self.inner.nack(requeue).await
    }
}

impl std::fmt::Debug for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Settlement")
    }
}

/// One consumed message awaiting settlement.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
    pub settlement: Settlement,
}

/// An active reply subscription.
pub struct ReplyChannel {
    /// Value to put in `reply_target` so replies land on this channel.
    pub target: String,
    pub replies: ReplyStream,
}

/// Named queues with publish, consume and explicit acknowledgement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()>;

    /// Publish to `routing_key` on the default exchange.
    async fn publish(&self, routing_key: &str, envelope: Envelope) -> BrokerResult<()>;

    /// Start consuming `queue` with at most `prefetch` unsettled deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream>;

    /// Subscribe to a private reply channel. The subscription is active on return.
    async fn open_reply_channel(&self) -> BrokerResult<ReplyChannel>;

    /// Resolve once the underlying connection is gone for good.
    async fn connection_lost(&self) -> BrokerError;

    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;
}
