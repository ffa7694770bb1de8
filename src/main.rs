//! Todo gateway.
//!
//! Serves the todo REST API and forwards every request to the worker tier
//! over the broker.
//!
//! # Architecture Overview
//!
//! ```text
//!   HTTP client                      ┌──────────────── todo-gateway ────────────────┐
//!   ───────────▶ axum router ───────▶│ handlers → TodoClient → RpcClient ──publish──┼──▶ command queue
//!                                    │                    ▲                          │        │
//!   ◀─────────── JSON response ◀─────│ ApiError/Json ◀────┴── correlator ◀── reply ─┼── reply target
//!                                    └──────────────────────────────────────────────┘        │
//!                                                                                             ▼
//!                                                                               todo-worker (RpcServer)
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use todo_bridge::broker::Broker;
use todo_bridge::config::{load_config, GatewayConfig};
use todo_bridge::http::GatewayServer;
use todo_bridge::lifecycle::{signals, startup, Shutdown};
use todo_bridge::observability::{logging, metrics};
use todo_bridge::rpc::RpcClient;
use todo_bridge::todo::TodoClient;

#[derive(Parser)]
#[command(name = "todo-gateway", version, about = "HTTP gateway for the todo workers")]
struct Args {
    /// Path to a TOML config file. Environment variables override it.
    #[arg(short, long, env = "TODO_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config: GatewayConfig = load_config(args.config.as_deref())?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "todo-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        broker = %config.broker.redacted_uri(),
        rpc_timeout_ms = config.rpc.timeout_ms,
        commands_queue = %config.queues.commands,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let broker = Arc::new(startup::connect_broker(&config.broker, "").await?);
    startup::declare_queues(broker.as_ref(), &config.queues.all_queues()).await?;

    let rpc = RpcClient::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        Duration::from_millis(config.rpc.timeout_ms),
    );
    let todos = Arc::new(TodoClient::new(rpc, config.queues.clone()));

    let shutdown = Shutdown::new();
    signals::spawn_signal_listener(shutdown.clone());
    let connection = startup::watch_connection(
        Arc::clone(&broker) as Arc<dyn Broker>,
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = GatewayServer::new(&config.listener, todos);
    server.run(listener, shutdown).await?;

    // Exit non-zero on broker loss so a supervisor restarts the gateway.
    if connection.is_finished() {
        let err = connection.await?;
        return Err(err.into());
    }
    connection.abort();

    if let Err(err) = broker.close().await {
        tracing::warn!(error = %err, "Broker connection did not close cleanly");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
