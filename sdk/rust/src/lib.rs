//! HTTP client for the todo gateway.

pub mod client;

pub use client::{NewTodo, SdkError, Todo, TodoClient, TodoUpdate};
