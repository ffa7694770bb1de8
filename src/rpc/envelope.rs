//! Wire units exchanged over the broker.
//!
//! An [`Envelope`] is what the broker moves around; the bridge only reads its
//! routing attributes. The reply payload is an encoded [`Outcome`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::rpc::token::CorrelationToken;

/// Message unit carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Links a reply to the call that issued it.
    pub correlation_token: Option<CorrelationToken>,
    /// Queue the reply must be published to. Absent on replies.
    pub reply_target: Option<String>,
    /// Opaque body, interpreted only by the command handler.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an outbound request.
    pub fn request(token: CorrelationToken, reply_target: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            correlation_token: Some(token),
            reply_target: Some(reply_target.into()),
            payload,
        }
    }

    /// Build the reply to a request carrying `token`.
    pub fn reply(token: CorrelationToken, payload: Vec<u8>) -> Self {
        Self {
            correlation_token: Some(token),
            reply_target: None,
            payload,
        }
    }
}

/// Closed taxonomy of failures a command handler may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Validation,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::Validation => "validation",
            FailureKind::Internal => "internal",
        }
    }
}

/// A classified handler failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for Failure {}

/// Result carried in a reply payload. Exactly one variant is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { data: Value },
    Failure { kind: FailureKind, message: String },
}

impl Outcome {
    pub fn success(data: Value) -> Self {
        Outcome::Success { data }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Split into the handler's data or its classified failure.
    pub fn into_result(self) -> Result<Value, Failure> {
        match self {
            Outcome::Success { data } => Ok(data),
            Outcome::Failure { kind, message } => Err(Failure { kind, message }),
        }
    }
}

impl From<Failure> for Outcome {
    fn from(failure: Failure) -> Self {
        Outcome::Failure {
            kind: failure.kind,
            message: failure.message,
        }
    }
}

impl From<Result<Value, Failure>> for Outcome {
    fn from(result: Result<Value, Failure>) -> Self {
        match result {
            Ok(data) => Outcome::success(data),
            Err(failure) => failure.into(),
        }
    }
}
