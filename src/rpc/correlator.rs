//! Reply correlation.
//!
//! # Responsibilities
//! - Track outstanding calls by correlation token
//! - Route each inbound reply to exactly one pending call, or discard it
//!
//! # Design Decisions
//! - Token table is a `DashMap`; insert/remove/lookup are safe across tasks
//! - Routing removes the entry, so a reply can complete a call at most once
//! - A [`PendingCall`] removes its own entry on drop, covering timeouts and
//!   cancelled callers
//! - One correlator per reply stream; once the stream ends it is closed for
//!   good and refuses new registrations

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::rpc::envelope::Envelope;
use crate::rpc::token::CorrelationToken;

/// Result of routing one inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Delivered,
    Unmatched,
}

/// Why a call could not be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The token is already outstanding.
    Duplicate,
    /// The reply stream behind this correlator has ended.
    Closed,
}

/// Table of outstanding calls sharing one reply stream.
#[derive(Debug, Default)]
pub struct ReplyCorrelator {
    pending: DashMap<CorrelationToken, oneshot::Sender<Envelope>>,
    closed: AtomicBool,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call on this reply stream.
    pub fn register(self: &Arc<Self>, token: CorrelationToken) -> Result<PendingCall, RegisterError> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(token.clone()) {
            Entry::Occupied(_) => Err(RegisterError::Duplicate),
            Entry::Vacant(slot) => {
                // Read under the shard lock: `disconnect_all` either sees this
                // entry when it clears, or we see the flag.
                if self.closed.load(Ordering::SeqCst) {
                    return Err(RegisterError::Closed);
                }
                slot.insert(tx);
                Ok(PendingCall {
                    token,
                    reply: rx,
                    correlator: Arc::clone(self),
                })
            }
        }
    }

    /// Hand an inbound reply to its pending call.
    pub fn route(&self, envelope: Envelope) -> Routed {
        let Some(token) = envelope.correlation_token.as_ref() else {
            return Routed::Unmatched;
        };
        match self.pending.remove(token) {
            Some((_, tx)) => match tx.send(envelope) {
                Ok(()) => Routed::Delivered,
                // Caller gave up between lookup and send.
                Err(_) => Routed::Unmatched,
            },
            None => Routed::Unmatched,
        }
    }

    /// Number of calls still waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Fail every outstanding call and refuse new ones. Called once the
    /// reply stream has ended.
    pub fn disconnect_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn forget(&self, token: &CorrelationToken) {
        self.pending.remove(token);
    }
}

/// Caller-side handle on one outstanding call.
#[derive(Debug)]
pub struct PendingCall {
    token: CorrelationToken,
    reply: oneshot::Receiver<Envelope>,
    correlator: Arc<ReplyCorrelator>,
}

impl PendingCall {
    /// Wait for the matching reply. `None` means the reply stream went away.
    pub async fn reply(&mut self) -> Option<Envelope> {
        (&mut self.reply).await.ok()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.correlator.forget(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_for(token: &str, body: &str) -> Envelope {
        Envelope::reply(CorrelationToken::from(token), body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_routes_reply_to_matching_call() {
        let correlator = Arc::new(ReplyCorrelator::new());
        let mut a = correlator.register("a".into()).unwrap();
        let mut b = correlator.register("b".into()).unwrap();

        assert_eq!(correlator.route(reply_for("b", "for-b")), Routed::Delivered);
        assert_eq!(correlator.route(reply_for("a", "for-a")), Routed::Delivered);

        assert_eq!(a.reply().await.unwrap().payload, b"for-a");
        assert_eq!(b.reply().await.unwrap().payload, b"for-b");
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn test_unknown_and_missing_tokens_are_unmatched() {
        let correlator = Arc::new(ReplyCorrelator::new());
        let _call = correlator.register("known".into()).unwrap();

        assert_eq!(correlator.route(reply_for("other", "x")), Routed::Unmatched);
        let anonymous = Envelope {
            correlation_token: None,
            reply_target: None,
            payload: Vec::new(),
        };
        assert_eq!(correlator.route(anonymous), Routed::Unmatched);
        assert_eq!(correlator.outstanding(), 1);
    }

    #[test]
    fn test_duplicate_token_is_rejected() {
        let correlator = Arc::new(ReplyCorrelator::new());
        let _first = correlator.register("dup".into()).unwrap();
        assert_eq!(
            correlator.register("dup".into()).unwrap_err(),
            RegisterError::Duplicate
        );
    }

    #[test]
    fn test_dropped_call_leaves_no_entry_and_late_reply_is_discarded() {
        let correlator = Arc::new(ReplyCorrelator::new());
        let call = correlator.register("late".into()).unwrap();
        drop(call);

        assert_eq!(correlator.outstanding(), 0);
        assert_eq!(correlator.route(reply_for("late", "x")), Routed::Unmatched);
    }

    #[tokio::test]
    async fn test_disconnect_fails_waiting_calls() {
        let correlator = Arc::new(ReplyCorrelator::new());
        let mut call = correlator.register("t".into()).unwrap();
        correlator.disconnect_all();
        assert!(call.reply().await.is_none());
    }

    #[test]
    fn test_closed_correlator_refuses_new_calls() {
        let correlator = Arc::new(ReplyCorrelator::new());
        correlator.disconnect_all();
        assert!(correlator.is_closed());
        assert_eq!(
            correlator.register("after".into()).unwrap_err(),
            RegisterError::Closed
        );
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_registration_and_routing() {
        let correlator = Arc::new(ReplyCorrelator::new());
        let mut tasks = Vec::new();
        for i in 0..64 {
            let correlator = correlator.clone();
            tasks.push(tokio::spawn(async move {
                let token = format!("t{i}");
                let mut call = correlator.register(token.as_str().into()).unwrap();
                let router = correlator.clone();
                let body = format!("body-{i}");
                tokio::spawn(async move { router.route(reply_for(&token, &body)) });
                call.reply().await.unwrap().payload
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), format!("body-{i}").into_bytes());
        }
        assert_eq!(correlator.outstanding(), 0);
    }
}
