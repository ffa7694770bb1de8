//! Resilience subsystem.
//!
//! # Design Decisions
//! - Retries happen only at startup while connecting to the broker
//! - RPC calls are never retried internally; the caller decides
//! - Every call has a deadline (see `rpc::client`)

pub mod backoff;
