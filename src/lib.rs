//! Todo CRUD over a broker request/reply bridge.
//!
//! An HTTP gateway turns each request into a command published on a broker
//! queue and waits for the correlated reply; workers consume the commands,
//! run them against storage and answer on the caller's reply target.

pub mod broker;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod rpc;
pub mod todo;

pub use config::{GatewayConfig, WorkerConfig};
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
pub use rpc::{RpcClient, RpcServer};
