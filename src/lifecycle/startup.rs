//! Startup orchestration.
//!
//! # Responsibilities
//! - Connect to the broker with bounded retries
//! - Declare the queues a process depends on before it takes traffic
//! - Turn a lost broker connection into a process shutdown
//!
//! # Design Decisions
//! - Brokers often come up after the services that use them; only an
//!   exhausted retry budget is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::broker::{AmqpBroker, Broker, BrokerError, BrokerResult};
use crate::config::BrokerConfig;
use crate::lifecycle::Shutdown;
use crate::resilience::backoff::Backoff;

/// Run `connect` until it succeeds or the schedule is spent.
pub async fn retry_connect<T, F, Fut>(backoff: Backoff, mut connect: F) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let mut attempt = 1;
    loop {
        match connect().await {
            Ok(connected) => return Ok(connected),
            Err(err) => match backoff.delay(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = backoff.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Broker connection failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    tracing::error!(attempts = attempt, error = %err, "Giving up on broker connection");
                    return Err(err);
                }
            },
        }
    }
}

/// Connect to RabbitMQ using the configured retry policy.
pub async fn connect_broker(config: &BrokerConfig, consumer_tag: &str) -> BrokerResult<AmqpBroker> {
    let backoff = Backoff {
        attempts: config.connect_attempts.max(1),
        base_ms: config.connect_backoff_ms,
        max_ms: config.connect_backoff_max_ms,
    };
    let broker = retry_connect(backoff, || AmqpBroker::connect(config)).await?;
    Ok(broker.with_consumer_tag(consumer_tag))
}

/// Declare every queue in `queues`.
pub async fn declare_queues(broker: &dyn Broker, queues: &[&str]) -> Result<(), BrokerError> {
    for queue in queues {
        broker.declare_queue(queue).await?;
        tracing::info!(queue = %queue, "Queue declared");
    }
    Ok(())
}

/// Trigger `shutdown` when the broker connection is lost.
///
/// The handle resolves with the loss; abort it before closing the broker on
/// a normal shutdown.
pub fn watch_connection(broker: Arc<dyn Broker>, shutdown: Shutdown) -> JoinHandle<BrokerError> {
    tokio::spawn(async move {
        let err = broker.connection_lost().await;
        tracing::error!(broker = broker.name(), error = %err, "Broker connection lost; shutting down");
        shutdown.trigger();
        err
    })
}
