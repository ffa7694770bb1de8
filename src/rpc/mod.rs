//! Request/reply bridge over the broker.
//!
//! # Data Flow
//! ```text
//! Caller side (client.rs):
//!     token.rs (mint token) → correlator.rs (register pending call)
//!     → publish request → await reply or deadline
//!
//! Callee side (server.rs):
//!     consume → decode command → CommandHandler → Outcome
//!     → publish reply to reply_target → ack
//! ```
//!
//! # Design Decisions
//! - The payload is opaque to the bridge; only the handler and the caller decode it
//! - Local failures (`Timeout`, `Unavailable`) never travel over the wire
//! - One reply channel per client, shared by all of its concurrent calls

pub mod client;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod server;
pub mod token;

pub use client::RpcClient;
pub use correlator::{PendingCall, RegisterError, ReplyCorrelator, Routed};
pub use envelope::{Envelope, Failure, FailureKind, Outcome};
pub use error::{CallError, ErrorKind, RpcError};
pub use server::{CommandHandler, RpcServer, ServerStats};
pub use token::{CorrelationToken, RandomTokens, SequentialTokens, TokenGenerator};
