//! Todo command handlers.
//!
//! # Responsibilities
//! - Validate command arguments
//! - Run the storage operation behind each command
//! - Classify every failure as `not_found`, `validation` or `internal`
//!
//! # Design Decisions
//! - One `match` over [`Command`] is the whole dispatch table
//! - Storage faults are logged here with detail and leave as a generic
//!   `internal` failure
//! - A worker can be limited to a subset of operations; anything else is a
//!   validation failure, never a silent drop

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::rpc::envelope::Failure;
use crate::rpc::server::CommandHandler;
use crate::todo::command::{Command, Operation};
use crate::todo::model::{NewTodo, Todo, TodoPatch};
use crate::todo::store::{StoreError, TodoStore};

pub struct TodoHandlers {
    store: Arc<dyn TodoStore>,
    allowed: Option<HashSet<Operation>>,
}

impl TodoHandlers {
    pub fn new(store: Arc<dyn TodoStore>) -> Self {
        Self {
            store,
            allowed: None,
        }
    }

    /// Only accept `operations`. An empty list accepts everything.
    pub fn with_operations(mut self, operations: &[Operation]) -> Self {
        self.allowed = if operations.is_empty() {
            None
        } else {
            Some(operations.iter().copied().collect())
        };
        self
    }

    pub fn accepts(&self, operation: Operation) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&operation))
    }

    pub async fn dispatch(&self, command: Command) -> Result<Value, Failure> {
        let operation = command.operation();
        if !self.accepts(operation) {
            return Err(Failure::validation(format!(
                "operation `{operation}` is not served on this queue"
            )));
        }

        match command {
            Command::List => self.list().await,
            Command::Get { id } => self.get(&id).await,
            Command::Create { todo } => self.create(todo).await,
            Command::Update { patch } => self.update(patch).await,
            Command::Delete { id } => self.delete(&id).await,
        }
    }

    async fn list(&self) -> Result<Value, Failure> {
        let todos = self.store.find_all().await.map_err(storage_failure)?;
        to_data(&todos)
    }

    async fn get(&self, id: &str) -> Result<Value, Failure> {
        require_id(id)?;
        match self.store.find_by_id(id).await.map_err(storage_failure)? {
            Some(todo) => to_data(&todo),
            None => Err(not_found(id)),
        }
    }

    async fn create(&self, new: NewTodo) -> Result<Value, Failure> {
        if new.text.trim().is_empty() {
            return Err(Failure::validation("text must not be empty"));
        }
        let todo = Todo {
            id: uuid::Uuid::new_v4().to_string(),
            text: new.text,
            done: new.done,
        };
        self.store
            .insert(todo.clone())
            .await
            .map_err(storage_failure)?;
        tracing::info!(id = %todo.id, "Todo created");
        to_data(&todo)
    }

    async fn update(&self, patch: TodoPatch) -> Result<Value, Failure> {
        require_id(&patch.id)?;
        if patch.is_empty() {
            return Err(Failure::validation("patch must set `text` or `done`"));
        }
        if matches!(&patch.text, Some(text) if text.trim().is_empty()) {
            return Err(Failure::validation("text must not be empty"));
        }

        let Some(mut todo) = self
            .store
            .find_by_id(&patch.id)
            .await
            .map_err(storage_failure)?
        else {
            return Err(not_found(&patch.id));
        };
        patch.apply(&mut todo);

        // Deleted between the read and the write.
        if !self
            .store
            .replace(todo.clone())
            .await
            .map_err(storage_failure)?
        {
            return Err(not_found(&patch.id));
        }
        tracing::info!(id = %todo.id, "Todo updated");
        to_data(&todo)
    }

    async fn delete(&self, id: &str) -> Result<Value, Failure> {
        require_id(id)?;
        if !self.store.delete(id).await.map_err(storage_failure)? {
            return Err(not_found(id));
        }
        tracing::info!(id = %id, "Todo deleted");
        Ok(json!({ "id": id }))
    }
}

#[async_trait]
impl CommandHandler for TodoHandlers {
    type Command = Command;

    async fn handle(&self, command: Command) -> Result<Value, Failure> {
        self.dispatch(command).await
    }

    fn operation_name(&self, command: &Command) -> &'static str {
        command.operation().as_str()
    }
}

fn require_id(id: &str) -> Result<(), Failure> {
    if id.trim().is_empty() {
        Err(Failure::validation("id must not be empty"))
    } else {
        Ok(())
    }
}

fn not_found(id: &str) -> Failure {
    Failure::not_found(format!("todo `{id}` not found"))
}

fn storage_failure(err: StoreError) -> Failure {
    tracing::error!(error = %err, "Storage operation failed");
    Failure::internal("storage failure")
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, Failure> {
    serde_json::to_value(value).map_err(|err| {
        tracing::error!(error = %err, "Failed to serialize result");
        Failure::internal("result could not be serialized")
    })
}
