//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Gateway, RPC client, RPC server produce:
//!     → logging.rs (structured log events, token/queue/operation fields)
//!     → metrics.rs (counters, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows from the HTTP layer into the gateway logs
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
