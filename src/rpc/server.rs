//! Callee side of the bridge.
//!
//! # Responsibilities
//! - Consume commands from one queue with a bounded number of worker slots
//! - Decode, dispatch and answer each command on its reply target
//! - Settle every delivery: ack after the reply is out, nack otherwise
//!
//! # Command States
//! ```text
//! Received → Dispatched → Replied → Acknowledged
//!                            ↘ (publish failed) Requeued | Discarded
//! ```
//!
//! # Design Decisions
//! - A delivery is acked only after its reply was confirmed; a failed reply
//!   is requeued once, then rejected so a poison message cannot loop forever
//! - Commands without a token or reply target are acked and dropped, since
//!   nobody could receive an answer
//! - Handler panics are caught per slot and answered as `internal`
//! - Connection loss stops the loop; in-flight slots are drained either way,
//!   for at most the drain timeout

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};

use crate::broker::{Broker, BrokerError, BrokerResult, Delivery};
use crate::observability::metrics;
use crate::rpc::envelope::{Envelope, Failure, Outcome};

/// Business logic behind an RPC queue.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    type Command: DeserializeOwned + Send + fmt::Debug + 'static;

    async fn handle(&self, command: Self::Command) -> Result<Value, Failure>;

    /// Label used in logs and metrics.
    fn operation_name(&self, _command: &Self::Command) -> &'static str {
        "command"
    }
}

/// Lifecycle of one command inside a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Received,
    Dispatched,
    Replied,
    Acknowledged,
    Requeued,
    Discarded,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Received => "received",
            CommandState::Dispatched => "dispatched",
            CommandState::Replied => "replied",
            CommandState::Acknowledged => "acknowledged",
            CommandState::Requeued => "requeued",
            CommandState::Discarded => "discarded",
        }
    }
}

/// Running totals for one server.
#[derive(Debug, Default)]
pub struct ServerStats {
    replied: AtomicU64,
    acked: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
    publish_failures: AtomicU64,
    handler_failures: AtomicU64,
}

impl ServerStats {
    /// Replies confirmed by the broker.
    pub fn replied(&self) -> u64 {
        self.replied.load(Ordering::Relaxed)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    /// Commands acked without a reply because they lacked routing attributes.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Commands answered with a `Failure` outcome, panics included.
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Consumes one queue and answers every command on it.
pub struct RpcServer<H: CommandHandler> {
    broker: Arc<dyn Broker>,
    handler: Arc<H>,
    queue: String,
    prefetch: u16,
    drain_timeout: Duration,
    stats: Arc<ServerStats>,
}

/// How long shutdown waits for in-flight commands by default.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

impl<H: CommandHandler> RpcServer<H> {
    pub fn new(broker: Arc<dyn Broker>, handler: Arc<H>, queue: impl Into<String>, prefetch: u16) -> Self {
        Self {
            broker,
            handler,
            queue: queue.into(),
            prefetch: prefetch.max(1),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            stats: Arc::new(ServerStats::default()),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until `shutdown` fires or the broker connection is lost.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> BrokerResult<()> {
        self.broker.declare_queue(&self.queue).await?;
        let mut deliveries = self.broker.consume(&self.queue, self.prefetch).await?;

        let slots = Arc::new(Semaphore::new(usize::from(self.prefetch)));
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<BrokerError>(1);

        tracing::info!(
            queue = %self.queue,
            prefetch = self.prefetch,
            broker = self.broker.name(),
            "Consuming commands"
        );

        let outcome = loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break Ok(()),
                Some(err) = fatal_rx.recv() => break Err(err),
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let delivery = tokio::select! {
                _ = shutdown.recv() => break Ok(()),
                Some(err) = fatal_rx.recv() => break Err(err),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => break Err(err),
                    None => break Err(BrokerError::Closed),
                },
            };

            let slot = Slot {
                broker: Arc::clone(&self.broker),
                handler: Arc::clone(&self.handler),
                stats: Arc::clone(&self.stats),
                fatal: fatal_tx.clone(),
                _permit: permit,
            };
            tokio::spawn(slot.process(delivery));
        };

        match &outcome {
            Ok(()) => tracing::info!(queue = %self.queue, "Stopped pulling commands; draining"),
            Err(err) => tracing::error!(queue = %self.queue, error = %err, "Broker lost; draining"),
        }
        // Every slot returns its permit when it finishes.
        let drained =
            tokio::time::timeout(self.drain_timeout, slots.acquire_many(u32::from(self.prefetch)))
                .await;
        match drained {
            Ok(_) => tracing::info!(queue = %self.queue, "All worker slots drained"),
            Err(_) => tracing::warn!(
                queue = %self.queue,
                abandoned = usize::from(self.prefetch) - slots.available_permits(),
                drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                "Drain timed out; abandoning in-flight commands"
            ),
        }

        match (outcome, fatal_rx.try_recv()) {
            (Ok(()), Ok(err)) => Err(err),
            (outcome, _) => outcome,
        }
    }
}

/// One command in flight. Holding the permit occupies a worker slot.
struct Slot<H: CommandHandler> {
    broker: Arc<dyn Broker>,
    handler: Arc<H>,
    stats: Arc<ServerStats>,
    fatal: mpsc::Sender<BrokerError>,
    _permit: OwnedSemaphorePermit,
}

impl<H: CommandHandler> Slot<H> {
    async fn process(self, delivery: Delivery) {
        let started = Instant::now();
        let Delivery {
            envelope,
            redelivered,
            settlement,
        } = delivery;

        let (token, reply_target) = match (envelope.correlation_token, envelope.reply_target) {
            (Some(token), Some(reply_target)) => (token, reply_target),
            (token, reply_target) => {
                tracing::error!(
                    token = ?token,
                    reply_target = ?reply_target,
                    "Command lacks routing attributes; acknowledging without reply"
                );
                ServerStats::bump(&self.stats.dropped);
                metrics::record_worker_command("unroutable", "dropped", started);
                if let Err(err) = settlement.ack().await {
                    self.settle_failed(err);
                }
                return;
            }
        };
        tracing::trace!(token = %token, redelivered, state = CommandState::Received.as_str());

        let (operation, outcome) = match serde_json::from_slice::<H::Command>(&envelope.payload) {
            Ok(command) => {
                let operation = self.handler.operation_name(&command);
                tracing::debug!(
                    token = %token,
                    operation,
                    state = CommandState::Dispatched.as_str(),
                    "Dispatching command"
                );
                (operation, self.dispatch(command).await)
            }
            Err(err) => {
                tracing::warn!(token = %token, error = %err, "Rejecting malformed command");
                let failure = Failure::validation(format!("malformed command: {err}"));
                ("malformed", Outcome::from(failure))
            }
        };

        let result = match &outcome {
            Outcome::Success { .. } => "success",
            Outcome::Failure { kind, .. } => {
                ServerStats::bump(&self.stats.handler_failures);
                kind.as_str()
            }
        };

        let payload = outcome.encode().unwrap_or_else(|err| {
            tracing::error!(token = %token, error = %err, "Failed to encode outcome");
            br#"{"status":"failure","kind":"internal","message":"reply could not be encoded"}"#
                .to_vec()
        });

        match self
            .broker
            .publish(&reply_target, Envelope::reply(token.clone(), payload))
            .await
        {
            Ok(()) => {
                ServerStats::bump(&self.stats.replied);
                tracing::trace!(token = %token, state = CommandState::Replied.as_str());
                match settlement.ack().await {
                    Ok(()) => {
                        ServerStats::bump(&self.stats.acked);
                        tracing::debug!(
                            token = %token,
                            operation,
                            result,
                            state = CommandState::Acknowledged.as_str(),
                            "Command complete"
                        );
                    }
                    Err(err) => self.settle_failed(err),
                }
                metrics::record_worker_command(operation, result, started);
            }
            Err(err) => {
                ServerStats::bump(&self.stats.publish_failures);
                metrics::record_reply_publish_failure(operation);
                metrics::record_worker_command(operation, "publish_failed", started);

                let requeue = !redelivered;
                let state = if requeue {
                    CommandState::Requeued
                } else {
                    CommandState::Discarded
                };
                tracing::error!(
                    token = %token,
                    reply_target = %reply_target,
                    operation,
                    redelivered,
                    state = state.as_str(),
                    error = %err,
                    "Failed to publish reply; command not acknowledged"
                );

                if err.is_connection_loss() {
                    self.report_fatal(err);
                    return;
                }
                match settlement.nack(requeue).await {
                    Ok(()) if requeue => ServerStats::bump(&self.stats.requeued),
                    Ok(()) => ServerStats::bump(&self.stats.discarded),
                    Err(err) => self.settle_failed(err),
                }
            }
        }
    }

    async fn dispatch(&self, command: H::Command) -> Outcome {
        let handler = Arc::clone(&self.handler);
        match AssertUnwindSafe(async move { handler.handle(command).await })
            .catch_unwind()
            .await
        {
            Ok(result) => Outcome::from(result),
            Err(panic) => {
                tracing::error!(panic = %panic_message(panic.as_ref()), "Command handler panicked");
                Outcome::from(Failure::internal("command handler panicked"))
            }
        }
    }

    fn settle_failed(&self, err: BrokerError) {
        tracing::error!(error = %err, "Failed to settle delivery");
        if err.is_connection_loss() {
            self.report_fatal(err);
        }
    }

    fn report_fatal(&self, err: BrokerError) {
        let _ = self.fatal.try_send(err);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::rpc::envelope::FailureKind;
    use crate::rpc::token::CorrelationToken;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Shout {
        text: String,
        #[serde(default)]
        explode: bool,
        #[serde(default)]
        hang: bool,
    }

    struct ShoutHandler;

    #[async_trait]
    impl CommandHandler for ShoutHandler {
        type Command = Shout;

        async fn handle(&self, command: Shout) -> Result<Value, Failure> {
            if command.explode {
                panic!("boom");
            }
            if command.hang {
                std::future::pending::<()>().await;
            }
            if command.text.is_empty() {
                return Err(Failure::validation("text is required"));
            }
            Ok(json!(command.text.to_uppercase()))
        }
    }

    struct Harness {
        broker: InMemoryBroker,
        replies: crate::broker::ReplyChannel,
        stats: Arc<ServerStats>,
        shutdown: broadcast::Sender<()>,
        server: tokio::task::JoinHandle<BrokerResult<()>>,
    }

    async fn start(prefetch: u16) -> Harness {
        start_with(prefetch, DEFAULT_DRAIN_TIMEOUT).await
    }

    async fn start_with(prefetch: u16, drain_timeout: Duration) -> Harness {
        let broker = InMemoryBroker::new();
        broker.declare_queue("shout").await.unwrap();
        let server = RpcServer::new(Arc::new(broker.clone()), Arc::new(ShoutHandler), "shout", prefetch)
            .with_drain_timeout(drain_timeout);
        let stats = server.stats();
        let (shutdown, rx) = broadcast::channel(1);
        let server = tokio::spawn(server.run(rx));
        let replies = broker.open_reply_channel().await.unwrap();
        Harness {
            broker,
            replies,
            stats,
            shutdown,
            server,
        }
    }

    impl Harness {
        async fn send(&self, token: &str, body: &[u8]) {
            let request = Envelope::request(
                CorrelationToken::from(token),
                self.replies.target.clone(),
                body.to_vec(),
            );
            self.broker.publish("shout", request).await.unwrap();
        }

        async fn next_outcome(&mut self) -> (CorrelationToken, Outcome) {
            let reply = tokio::time::timeout(Duration::from_secs(1), self.replies.replies.next())
                .await
                .unwrap()
                .unwrap();
            (
                reply.correlation_token.unwrap(),
                Outcome::decode(&reply.payload).unwrap(),
            )
        }
    }

    #[tokio::test]
    async fn test_replies_with_original_token_then_acks() {
        let mut h = start(2).await;
        h.send("abc", br#"{"text":"hi"}"#).await;

        let (token, outcome) = h.next_outcome().await;
        assert_eq!(token.as_str(), "abc");
        assert_eq!(outcome, Outcome::success(json!("HI")));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.stats.acked(), 1);
        assert_eq!(h.broker.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_handler_failure_and_malformed_payload_are_answered() {
        let mut h = start(1).await;
        h.send("empty", br#"{"text":""}"#).await;
        let (_, outcome) = h.next_outcome().await;
        assert!(matches!(outcome, Outcome::Failure { kind: FailureKind::Validation, .. }));

        h.send("junk", b"{not json").await;
        let (token, outcome) = h.next_outcome().await;
        assert_eq!(token.as_str(), "junk");
        assert!(matches!(outcome, Outcome::Failure { kind: FailureKind::Validation, .. }));
        assert_eq!(h.stats.handler_failures(), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_yields_internal_and_loop_survives() {
        let mut h = start(1).await;
        h.send("bad", br#"{"text":"x","explode":true}"#).await;
        let (_, outcome) = h.next_outcome().await;
        assert!(matches!(outcome, Outcome::Failure { kind: FailureKind::Internal, .. }));

        h.send("good", br#"{"text":"ok"}"#).await;
        let (_, outcome) = h.next_outcome().await;
        assert_eq!(outcome, Outcome::success(json!("OK")));
    }

    #[tokio::test]
    async fn test_command_without_reply_target_is_dropped_and_acked() {
        let h = start(1).await;
        let orphan = Envelope {
            correlation_token: Some(CorrelationToken::from("orphan")),
            reply_target: None,
            payload: br#"{"text":"hi"}"#.to_vec(),
        };
        h.broker.publish("shout", orphan).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.stats.dropped(), 1);
        assert_eq!(h.broker.stats().acked, 1);
        assert_eq!(h.broker.stats().requeued, 0);
    }

    #[tokio::test]
    async fn test_shutdown_returns_cleanly() {
        let h = start(4).await;
        h.shutdown.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), h.server).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_hung_handler_does_not_block_shutdown_past_drain_timeout() {
        let h = start_with(2, Duration::from_millis(100)).await;
        h.send("stuck", br#"{"text":"x","hang":true}"#).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.shutdown.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), h.server).await.unwrap();
        assert!(result.unwrap().is_ok());
        assert_eq!(h.stats.acked(), 0);
        assert_eq!(h.stats.replied(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_ends_run_with_error() {
        let h = start(1).await;
        h.broker.close();
        let result = tokio::time::timeout(Duration::from_secs(1), h.server).await.unwrap();
        assert!(matches!(result.unwrap(), Err(BrokerError::Closed)));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
