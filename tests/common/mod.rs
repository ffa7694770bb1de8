//! Shared fixtures for the integration tests.
//!
//! Every stack runs in-process: the gateway on an ephemeral port, one worker
//! consuming the command queue, both joined by an `InMemoryBroker`.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use todo_bridge::broker::{Broker, BrokerResult, InMemoryBroker};
use todo_bridge::config::{ListenerConfig, QueueConfig};
use todo_bridge::http::GatewayServer;
use todo_bridge::lifecycle::Shutdown;
use todo_bridge::rpc::{CommandHandler, Failure, RpcClient, RpcServer, ServerStats};
use todo_bridge::todo::{MemoryStore, TodoClient, TodoHandlers, TodoStore};

pub const COMMANDS: &str = "todo.commands";

/// Answers every command with `{"echo": <command>}`, upper-casing strings.
pub struct EchoHandler;

#[async_trait]
impl CommandHandler for EchoHandler {
    type Command = Value;

    async fn handle(&self, command: Value) -> Result<Value, Failure> {
        if command.get("panic").is_some() {
            panic!("echo asked to panic");
        }
        let echoed = match command {
            Value::String(text) => Value::String(text.to_uppercase()),
            other => other,
        };
        Ok(json!({ "echo": echoed }))
    }
}

pub struct Worker {
    pub stats: Arc<ServerStats>,
    pub handle: JoinHandle<BrokerResult<()>>,
}

/// Declare `queue` and serve it with `handler` until `shutdown` fires.
pub async fn spawn_worker<H: CommandHandler>(
    broker: &InMemoryBroker,
    handler: H,
    queue: &str,
    prefetch: u16,
    shutdown: &Shutdown,
) -> Worker {
    broker.declare_queue(queue).await.unwrap();
    let server = RpcServer::new(
        Arc::new(broker.clone()) as Arc<dyn Broker>,
        Arc::new(handler),
        queue,
        prefetch,
    );
    let stats = server.stats();
    let handle = tokio::spawn(server.run(shutdown.subscribe()));
    Worker { stats, handle }
}

pub fn rpc_client(broker: &InMemoryBroker, timeout: Duration) -> RpcClient {
    RpcClient::new(Arc::new(broker.clone()) as Arc<dyn Broker>, timeout)
}

/// Gateway plus one todo worker over a shared broker.
pub struct Stack {
    pub broker: InMemoryBroker,
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub worker: Worker,
    pub store: Arc<MemoryStore>,
    pub todos: Arc<TodoClient>,
}

impl Stack {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn sdk(&self) -> todo_sdk::TodoClient {
        todo_sdk::TodoClient::new(&self.url())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_stack(rpc_timeout: Duration) -> Stack {
    let broker = InMemoryBroker::new();
    let shutdown = Shutdown::new();

    let store = Arc::new(MemoryStore::new());
    let worker = spawn_worker(
        &broker,
        TodoHandlers::new(Arc::clone(&store) as Arc<dyn TodoStore>),
        COMMANDS,
        8,
        &shutdown,
    )
    .await;

    start_gateway(broker, shutdown, worker, store, rpc_timeout).await
}

/// Gateway only; the command queue exists but nobody consumes it.
pub async fn start_gateway_without_worker(rpc_timeout: Duration) -> Stack {
    let broker = InMemoryBroker::new();
    broker.declare_queue(COMMANDS).await.unwrap();
    let shutdown = Shutdown::new();
    let worker = Worker {
        stats: Arc::new(ServerStats::default()),
        handle: tokio::spawn(async { Ok(()) }),
    };
    start_gateway(broker, shutdown, worker, Arc::new(MemoryStore::new()), rpc_timeout).await
}

async fn start_gateway(
    broker: InMemoryBroker,
    shutdown: Shutdown,
    worker: Worker,
    store: Arc<MemoryStore>,
    rpc_timeout: Duration,
) -> Stack {
    let queues = QueueConfig {
        commands: COMMANDS.to_string(),
        ..QueueConfig::default()
    };
    let todos = Arc::new(TodoClient::new(rpc_client(&broker, rpc_timeout), queues));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(&ListenerConfig::default(), Arc::clone(&todos));
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    Stack {
        broker,
        addr,
        shutdown,
        worker,
        store,
        todos,
    }
}
