//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Init logging/metrics → Connect broker (retry) → Declare queues → Serve
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting / stop pulling → Drain → Close broker → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then broker, then listeners
//! - Ordered shutdown: stop intake, drain, close

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
