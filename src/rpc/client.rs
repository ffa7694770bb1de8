//! Caller side of the bridge.
//!
//! # Responsibilities
//! - Publish a request and wait for exactly one correlated reply
//! - Enforce a per-call deadline
//! - Keep one reply channel alive and re-open it after it dies
//!
//! # Design Decisions
//! - The reply listener is running and the call is registered before the
//!   request is published, so an immediate reply cannot be lost
//! - Every reply channel has its own correlator; a call registered against a
//!   channel that already ended fails at once with `Unavailable`
//! - No internal retries; a failed publish surfaces as `Unavailable`
//! - When the reply stream ends, every outstanding call fails with
//!   `Unavailable` and the next call opens a fresh channel

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broker::{Broker, ReplyStream};
use crate::observability::metrics;
use crate::rpc::correlator::{RegisterError, ReplyCorrelator, Routed};
use crate::rpc::envelope::{Envelope, Outcome};
use crate::rpc::error::RpcError;
use crate::rpc::token::{RandomTokens, TokenGenerator};

struct ReplyLink {
    target: String,
    correlator: Arc<ReplyCorrelator>,
    listener: JoinHandle<()>,
}

impl ReplyLink {
    fn is_live(&self) -> bool {
        !self.correlator.is_closed() && !self.listener.is_finished()
    }
}

/// Issues calls over a broker and correlates their replies.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    tokens: Arc<dyn TokenGenerator>,
    timeout: Duration,
    reply: Mutex<Option<ReplyLink>>,
    // Correlator of the newest reply channel, readable without awaiting.
    current: std::sync::Mutex<Arc<ReplyCorrelator>>,
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>, timeout: Duration) -> Self {
        Self {
            broker,
            tokens: Arc::new(RandomTokens),
            timeout,
            reply: Mutex::new(None),
            current: std::sync::Mutex::new(Arc::new(ReplyCorrelator::new())),
        }
    }

    pub fn with_token_generator(mut self, tokens: Arc<dyn TokenGenerator>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of calls still waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .outstanding()
    }

    /// Call with the client's default deadline.
    pub async fn call(&self, routing_key: &str, payload: Vec<u8>) -> Result<Outcome, RpcError> {
        self.call_with_timeout(routing_key, payload, self.timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Outcome, RpcError> {
        let started = Instant::now();
        let result = self.exchange(routing_key, payload, timeout).await;

        let label = match &result {
            Ok(Outcome::Success { .. }) => "success",
            Ok(Outcome::Failure { .. }) => "failure",
            Err(err) => err.kind().as_str(),
        };
        metrics::record_rpc_call(routing_key, label, started);
        result
    }

    async fn exchange(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Outcome, RpcError> {
        let (target, correlator) = self.reply_target().await?;

        let token = self.tokens.next_token();
        let mut pending = correlator.register(token.clone()).map_err(|err| match err {
            RegisterError::Duplicate => RpcError::DuplicateToken(token.clone()),
            RegisterError::Closed => {
                tracing::warn!(
                    token = %token,
                    reply_target = %target,
                    "Reply channel ended before the call was registered"
                );
                RpcError::Unavailable("reply channel closed".to_string())
            }
        })?;

        let request = Envelope::request(token.clone(), target, payload);
        if let Err(err) = self.broker.publish(routing_key, request).await {
            tracing::warn!(
                token = %token,
                routing_key = %routing_key,
                error = %err,
                "Failed to publish request"
            );
            return Err(RpcError::Unavailable(err.to_string()));
        }
        tracing::debug!(token = %token, routing_key = %routing_key, "Request published");

        let reply = match tokio::time::timeout(timeout, pending.reply()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                return Err(RpcError::Unavailable("reply channel closed".to_string()));
            }
            Err(_) => {
                tracing::warn!(
                    token = %token,
                    routing_key = %routing_key,
                    timeout_ms = timeout.as_millis() as u64,
                    "No reply before deadline"
                );
                return Err(RpcError::Timeout(timeout));
            }
        };

        Outcome::decode(&reply.payload).map_err(|err| {
            tracing::error!(token = %token, error = %err, "Undecodable reply");
            RpcError::Decode(err.to_string())
        })
    }

    /// Reply target and correlator of a live channel, opening one if needed.
    async fn reply_target(&self) -> Result<(String, Arc<ReplyCorrelator>), RpcError> {
        let mut link = self.reply.lock().await;
        if let Some(active) = link.as_ref() {
            if active.is_live() {
                return Ok((active.target.clone(), Arc::clone(&active.correlator)));
            }
        }

        let channel = self
            .broker
            .open_reply_channel()
            .await
            .map_err(|err| RpcError::Unavailable(err.to_string()))?;
        tracing::info!(
            broker = self.broker.name(),
            reply_target = %channel.target,
            "Reply channel open"
        );

        let correlator = Arc::new(ReplyCorrelator::new());
        let listener = tokio::spawn(listen(channel.replies, Arc::clone(&correlator)));
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::clone(&correlator);
        *link = Some(ReplyLink {
            target: channel.target.clone(),
            correlator: Arc::clone(&correlator),
            listener,
        });
        Ok((channel.target, correlator))
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(link) = self.reply.get_mut().take() {
            link.listener.abort();
        }
    }
}

async fn listen(mut replies: ReplyStream, correlator: Arc<ReplyCorrelator>) {
    while let Some(envelope) = replies.next().await {
        let token = envelope.correlation_token.clone();
        if correlator.route(envelope) == Routed::Unmatched {
            tracing::debug!(token = ?token, "Discarding unmatched reply");
            metrics::record_unmatched_reply();
        }
    }

    tracing::warn!(
        outstanding = correlator.outstanding(),
        "Reply channel closed; failing outstanding calls"
    );
    correlator.disconnect_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, BrokerResult, DeliveryStream, InMemoryBroker, ReplyChannel};
    use crate::rpc::envelope::Failure;
    use crate::rpc::error::ErrorKind;
    use crate::rpc::token::{CorrelationToken, SequentialTokens};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Reply to every request on `queue` with `respond(payload)`.
    async fn spawn_responder<F>(broker: &InMemoryBroker, queue: &str, respond: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + 'static,
    {
        broker.declare_queue(queue).await.unwrap();
        let mut deliveries = broker.consume(queue, 16).await.unwrap();
        let publisher = broker.clone();
        tokio::spawn(async move {
            while let Some(Ok(delivery)) = deliveries.next().await {
                let envelope = delivery.envelope;
                let reply = Envelope::reply(
                    envelope.correlation_token.unwrap(),
                    respond(&envelope.payload),
                );
                publisher
                    .publish(&envelope.reply_target.unwrap(), reply)
                    .await
                    .unwrap();
                delivery.settlement.ack().await.unwrap();
            }
        });
    }

    fn client(broker: &InMemoryBroker, timeout: Duration) -> RpcClient {
        RpcClient::new(Arc::new(broker.clone()), timeout)
    }

    #[tokio::test]
    async fn test_call_returns_correlated_outcome() {
        let broker = InMemoryBroker::new();
        spawn_responder(&broker, "upper", |payload| {
            let text = String::from_utf8_lossy(payload).to_uppercase();
            Outcome::success(json!(text)).encode().unwrap()
        })
        .await;

        let client = client(&broker, Duration::from_secs(1));
        let outcome = client.call("upper", b"hello".to_vec()).await.unwrap();
        assert_eq!(outcome, Outcome::success(json!("HELLO")));
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_failure_outcome_is_not_an_rpc_error() {
        let broker = InMemoryBroker::new();
        spawn_responder(&broker, "missing", |_| {
            Outcome::from(Failure::not_found("nope")).encode().unwrap()
        })
        .await;

        let client = client(&broker, Duration::from_secs(1));
        let failure = client
            .call("missing", Vec::new())
            .await
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(failure, Failure::not_found("nope"));
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_pending_call() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("silent").await.unwrap();

        let client = client(&broker, Duration::from_millis(30));
        let err = client.call("silent", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_closed_broker_is_unavailable() {
        let broker = InMemoryBroker::new();
        broker.close();

        let client = client(&broker, Duration::from_secs(1));
        let err = client.call("any", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_garbage_reply_is_internal() {
        let broker = InMemoryBroker::new();
        spawn_responder(&broker, "garbage", |_| b"not json".to_vec()).await;

        let client = client(&broker, Duration::from_secs(1));
        let err = client.call("garbage", Vec::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_reply_channel_is_reused() {
        let broker = InMemoryBroker::new();
        spawn_responder(&broker, "echo", |p| {
            Outcome::success(json!(String::from_utf8_lossy(p))).encode().unwrap()
        })
        .await;

        let client = client(&broker, Duration::from_secs(1))
            .with_token_generator(Arc::new(SequentialTokens::new("t")));
        client.call("echo", b"1".to_vec()).await.unwrap();
        let first = client.reply.lock().await.as_ref().unwrap().target.clone();
        client.call("echo", b"2".to_vec()).await.unwrap();
        let second = client.reply.lock().await.as_ref().unwrap().target.clone();
        assert_eq!(first, second);
    }

    /// Broker whose first reply channel ends as soon as `cut` is notified.
    struct CuttableReplies {
        inner: InMemoryBroker,
        cut: Arc<Notify>,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl Broker for CuttableReplies {
        async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
            self.inner.declare_queue(queue).await
        }

        async fn publish(&self, routing_key: &str, envelope: Envelope) -> BrokerResult<()> {
            self.inner.publish(routing_key, envelope).await
        }

        async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream> {
            self.inner.consume(queue, prefetch).await
        }

        async fn open_reply_channel(&self) -> BrokerResult<ReplyChannel> {
            let channel = self.inner.open_reply_channel().await?;
            if self.opened.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(channel);
            }
            let cut = Arc::clone(&self.cut);
            Ok(ReplyChannel {
                target: channel.target,
                replies: channel
                    .replies
                    .take_until(async move { cut.notified().await })
                    .boxed(),
            })
        }

        async fn connection_lost(&self) -> BrokerError {
            self.inner.connection_lost().await
        }

        fn name(&self) -> &'static str {
            "cuttable"
        }
    }

    /// Ends the reply stream while the first token is being minted.
    struct CutOnFirstToken {
        cut: Arc<Notify>,
        fired: AtomicBool,
        tokens: SequentialTokens,
    }

    impl TokenGenerator for CutOnFirstToken {
        fn next_token(&self) -> CorrelationToken {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.cut.notify_one();
                // Let the listener on the other worker thread see the end of its stream.
                std::thread::sleep(Duration::from_millis(100));
            }
            self.tokens.next_token()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_channel_ending_before_registration_is_unavailable() {
        let inner = InMemoryBroker::new();
        inner.declare_queue("void").await.unwrap();
        spawn_responder(&inner, "echo", |p| {
            Outcome::success(json!(String::from_utf8_lossy(p))).encode().unwrap()
        })
        .await;

        let cut = Arc::new(Notify::new());
        let broker = CuttableReplies {
            inner: inner.clone(),
            cut: Arc::clone(&cut),
            opened: AtomicUsize::new(0),
        };
        let client = RpcClient::new(Arc::new(broker), Duration::from_secs(2)).with_token_generator(
            Arc::new(CutOnFirstToken {
                cut,
                fired: AtomicBool::new(false),
                tokens: SequentialTokens::new("cut"),
            }),
        );

        let started = Instant::now();
        let err = client.call("void", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.outstanding(), 0);

        // The next call opens a fresh channel.
        let outcome = client.call("echo", b"again".to_vec()).await.unwrap();
        assert_eq!(outcome, Outcome::success(json!("again")));
    }
}
