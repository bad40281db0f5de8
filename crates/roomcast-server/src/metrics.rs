//! Metrics collection and export for Roomcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use roomcast_protocol::FanoutSummary;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roomcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roomcast_connections_active";
    pub const MESSAGES_TOTAL: &str = "roomcast_messages_total";
    pub const MESSAGES_BYTES: &str = "roomcast_messages_bytes";
    pub const PUBLISHES_TOTAL: &str = "roomcast_publishes_total";
    pub const ASSIGNMENTS_TOTAL: &str = "roomcast_assignments_total";
    pub const FANOUT_FAILURES_TOTAL: &str = "roomcast_fanout_failures_total";
    pub const PARTITIONS_ACTIVE: &str = "roomcast_partitions_active";
    pub const PUBLISH_LATENCY_SECONDS: &str = "roomcast_publish_latency_seconds";
    pub const ERRORS_TOTAL: &str = "roomcast_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of client messages received");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of client messages and publishes");
    metrics::describe_counter!(names::PUBLISHES_TOTAL, "Total number of ingress publishes");
    metrics::describe_counter!(
        names::ASSIGNMENTS_TOTAL,
        "Partition assignments by outcome"
    );
    metrics::describe_counter!(
        names::FANOUT_FAILURES_TOTAL,
        "Partitions that missed a broadcast publish"
    );
    metrics::describe_gauge!(
        names::PARTITIONS_ACTIVE,
        "Partitions in the coordinator's table"
    );
    metrics::describe_histogram!(
        names::PUBLISH_LATENCY_SECONDS,
        "Broadcast publish latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a completed broadcast publish.
pub fn record_publish(bytes: usize, summary: FanoutSummary, seconds: f64) {
    counter!(names::PUBLISHES_TOTAL).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => "publish").increment(bytes as u64);
    if summary.failed > 0 {
        counter!(names::FANOUT_FAILURES_TOTAL).increment(summary.failed as u64);
    }
    histogram!(names::PUBLISH_LATENCY_SECONDS).record(seconds);
}

/// Record a partition assignment.
pub fn record_assignment(outcome: &'static str) {
    counter!(names::ASSIGNMENTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Update the partition count.
pub fn set_active_partitions(count: usize) {
    gauge!(names::PARTITIONS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder is installed; recording must still be a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_publish(10, FanoutSummary { delivered: 1, failed: 1 }, 0.001);
    }
}
