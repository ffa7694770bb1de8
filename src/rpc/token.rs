//! Correlation tokens and the generators that mint them.
//!
//! # Responsibilities
//! - Give every outstanding call an opaque identifier
//! - Keep generation behind a trait so tests can use deterministic tokens
//!
//! # Design Decisions
//! - Fixed-length tokens drawn uniformly from an alphanumeric alphabet
//! - Uniqueness matters, unpredictability does not

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Length of tokens produced by [`RandomTokens`].
pub const TOKEN_LENGTH: usize = 32;

/// Opaque identifier linking a reply to the call that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of correlation tokens for an RPC client.
pub trait TokenGenerator: Send + Sync {
    fn next_token(&self) -> CorrelationToken;
}

/// Random fixed-length alphanumeric tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokens;

impl TokenGenerator for RandomTokens {
    fn next_token(&self) -> CorrelationToken {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();
        CorrelationToken(token)
    }
}

/// Deterministic `<prefix>-<n>` tokens, for tests and replay tooling.
#[derive(Debug)]
pub struct SequentialTokens {
    prefix: String,
    next: AtomicU64,
}

impl SequentialTokens {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl TokenGenerator for SequentialTokens {
    fn next_token(&self) -> CorrelationToken {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        CorrelationToken(format!("{}-{}", self.prefix, n))
    }
}
