//! Caller-side error taxonomy.

use std::time::Duration;

use crate::rpc::envelope::{Failure, FailureKind};
use crate::rpc::token::CorrelationToken;

/// Stable error kinds surfaced to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Unavailable,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl From<FailureKind> for ErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::NotFound => ErrorKind::NotFound,
            FailureKind::Validation => ErrorKind::Validation,
            FailureKind::Internal => ErrorKind::Internal,
        }
    }
}

/// Errors raised by the RPC client itself, before any worker classified anything.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("request could not be encoded: {0}")]
    Encode(String),

    #[error("reply could not be decoded: {0}")]
    Decode(String),

    #[error("correlation token `{0}` is already outstanding")]
    DuplicateToken(CorrelationToken),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Unavailable(_) => ErrorKind::Unavailable,
            RpcError::Timeout(_) => ErrorKind::Timeout,
            RpcError::Encode(_) | RpcError::Decode(_) | RpcError::DuplicateToken(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Either a local RPC failure or a failure classified by the worker.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("{0}")]
    Remote(#[from] Failure),
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Rpc(err) => err.kind(),
            CallError::Remote(failure) => failure.kind.into(),
        }
    }
}
