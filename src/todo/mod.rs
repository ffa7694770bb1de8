//! Todo domain: the commands a worker serves and the typed gateway client.
//!
//! # Data Flow
//! ```text
//! Gateway:  TodoClient → Command (JSON) → RpcClient
//! Worker:   RpcServer → Command → TodoHandlers → TodoStore
//! ```

pub mod client;
pub mod command;
pub mod handlers;
pub mod model;
pub mod store;

pub use client::TodoClient;
pub use command::{Command, Operation};
pub use handlers::TodoHandlers;
pub use model::{NewTodo, Todo, TodoPatch};
pub use store::{MemoryStore, StoreError, TodoStore};
