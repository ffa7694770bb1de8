//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway, RPC and worker metrics
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): HTTP requests by method, route, status
//! - `gateway_request_duration_seconds` (histogram): HTTP latency
//! - `rpc_calls_total` (counter): calls by routing key and result
//! - `rpc_call_duration_seconds` (histogram): time from publish to reply
//! - `rpc_unmatched_replies_total` (counter): late or foreign replies discarded
//! - `worker_commands_total` (counter): commands by operation and result
//! - `worker_command_duration_seconds` (histogram): decode to settlement
//! - `worker_reply_publish_failures_total` (counter): replies that never left
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(err) => tracing::error!(address = %addr, error = %err, "Failed to install metrics exporter"),
    }
}

pub fn record_http_request(method: &str, route: &'static str, status: u16, started: Instant) {
    metrics::counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "route" => route,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "route" => route)
        .record(started.elapsed().as_secs_f64());
}

pub fn record_rpc_call(routing_key: &str, result: &'static str, started: Instant) {
    metrics::counter!(
        "rpc_calls_total",
        "routing_key" => routing_key.to_string(),
        "result" => result
    )
    .increment(1);
    metrics::histogram!("rpc_call_duration_seconds", "routing_key" => routing_key.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn record_unmatched_reply() {
    metrics::counter!("rpc_unmatched_replies_total").increment(1);
}

pub fn record_worker_command(operation: &'static str, result: &'static str, started: Instant) {
    metrics::counter!("worker_commands_total", "operation" => operation, "result" => result)
        .increment(1);
    metrics::histogram!("worker_command_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

pub fn record_reply_publish_failure(operation: &'static str) {
    metrics::counter!("worker_reply_publish_failures_total", "operation" => operation)
        .increment(1);
}
