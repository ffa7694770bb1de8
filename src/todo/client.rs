//! Typed todo calls on top of [`RpcClient`].

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::QueueConfig;
use crate::rpc::client::RpcClient;
use crate::rpc::error::{CallError, RpcError};
use crate::todo::command::Command;
use crate::todo::model::{NewTodo, Todo, TodoPatch};

/// Gateway-side client for the todo command queues.
pub struct TodoClient {
    rpc: RpcClient,
    queues: QueueConfig,
}

impl TodoClient {
    pub fn new(rpc: RpcClient, queues: QueueConfig) -> Self {
        Self { rpc, queues }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub async fn list(&self) -> Result<Vec<Todo>, CallError> {
        self.send(Command::List).await
    }

    pub async fn get(&self, id: &str) -> Result<Todo, CallError> {
        self.send(Command::Get { id: id.to_string() }).await
    }

    pub async fn create(&self, todo: NewTodo) -> Result<Todo, CallError> {
        self.send(Command::Create { todo }).await
    }

    pub async fn update(&self, patch: TodoPatch) -> Result<Todo, CallError> {
        self.send(Command::Update { patch }).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), CallError> {
        let _: Value = self.send(Command::Delete { id: id.to_string() }).await?;
        Ok(())
    }

    async fn send<T: DeserializeOwned>(&self, command: Command) -> Result<T, CallError> {
        let queue = self.queues.queue_for(command.operation());
        let payload =
            serde_json::to_vec(&command).map_err(|err| RpcError::Encode(err.to_string()))?;

        let data = self.rpc.call(queue, payload).await?.into_result()?;
        serde_json::from_value(data).map_err(|err| RpcError::Decode(err.to_string()).into())
    }
}
