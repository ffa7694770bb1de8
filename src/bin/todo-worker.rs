//! Todo worker.
//!
//! Consumes todo commands from one queue, runs them against the store and
//! publishes each outcome on the caller's reply target. Exits non-zero when
//! the broker connection is lost so a supervisor can restart it.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use todo_bridge::broker::Broker;
use todo_bridge::config::{load_config, WorkerConfig};
use todo_bridge::lifecycle::{signals, startup, Shutdown};
use todo_bridge::observability::{logging, metrics};
use todo_bridge::rpc::RpcServer;
use todo_bridge::todo::{MemoryStore, TodoHandlers, TodoStore};

#[derive(Parser)]
#[command(name = "todo-worker", version, about = "Serves todo commands from a broker queue")]
struct Args {
    /// Path to a TOML config file. Environment variables override it.
    #[arg(short, long, env = "TODO_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config: WorkerConfig = load_config(args.config.as_deref())?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "todo-worker starting");
    tracing::info!(
        queue = %config.worker.queue,
        prefetch = config.worker.prefetch,
        operations = ?config.worker.operations,
        broker = %config.broker.redacted_uri(),
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

    let store: Arc<dyn TodoStore> = match &config.storage.snapshot_path {
        Some(path) => Arc::new(MemoryStore::open(path.clone())?),
        None => Arc::new(MemoryStore::new()),
    };
    let handlers = Arc::new(TodoHandlers::new(store).with_operations(&config.worker.operations));

    let broker = Arc::new(startup::connect_broker(&config.broker, &config.worker.consumer_tag).await?);

    let shutdown = Shutdown::new();
    signals::spawn_signal_listener(shutdown.clone());

    let server = RpcServer::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        handlers,
        config.worker.queue.clone(),
        config.worker.prefetch,
    )
    .with_drain_timeout(Duration::from_secs(config.worker.drain_timeout_secs));
    let stats = server.stats();
    let result = server.run(shutdown.subscribe()).await;

    tracing::info!(
        replied = stats.replied(),
        acked = stats.acked(),
        dropped = stats.dropped(),
        requeued = stats.requeued(),
        discarded = stats.discarded(),
        publish_failures = stats.publish_failures(),
        "Worker stopped"
    );

    if let Err(err) = result {
        tracing::error!(error = %err, "Broker connection lost");
        return Err(err.into());
    }

    if let Err(err) = broker.close().await {
        tracing::warn!(error = %err, "Broker connection did not close cleanly");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
