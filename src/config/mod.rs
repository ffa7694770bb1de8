//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (environment overrides)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig / WorkerConfig (validated, immutable)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_config_with_env, ConfigError, ServiceConfig};
pub use schema::{
    BrokerConfig, GatewayConfig, ListenerConfig, LogFormat, ObservabilityConfig, QueueConfig,
    RpcConfig, StorageConfig, WorkerConfig, WorkerSettings,
};
pub use validation::ValidationError;
