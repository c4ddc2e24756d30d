//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tenvis_courier_core::{HubStats, NodeHealth};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const SESSIONS_ACTIVE: &str = "courier_sessions_active";
    pub const MESSAGES_TOTAL: &str = "courier_messages_total";
    pub const MESSAGES_BYTES: &str = "courier_messages_bytes";
    pub const TOPICS_ACTIVE: &str = "courier_topics_active";
    pub const PROXIES_ACTIVE: &str = "courier_proxy_topics_active";
    pub const REQUEST_SECONDS: &str = "courier_request_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
    pub const CLUSTER_FAILURES_TOTAL: &str = "courier_cluster_failures_total";
    pub const CLUSTER_NODES: &str = "courier_cluster_nodes";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open client connections"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of live sessions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Authoritative topics on this node");
    metrics::describe_gauge!(names::PROXIES_ACTIVE, "Proxy topics on this node");
    metrics::describe_histogram!(
        names::REQUEST_SECONDS,
        "Client request latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of error replies");
    metrics::describe_counter!(
        names::CLUSTER_FAILURES_TOTAL,
        "Requests that failed because the owning node was unreachable"
    );
    metrics::describe_gauge!(names::CLUSTER_NODES, "Cluster nodes by health");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

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

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record request latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::REQUEST_SECONDS).record(seconds);
}

/// Record an error reply by code.
pub fn record_error(code: u16) {
    counter!(names::ERRORS_TOTAL, "code" => code.to_string()).increment(1);
    if code == 503 {
        counter!(names::CLUSTER_FAILURES_TOTAL).increment(1);
    }
}

/// Update hub gauges.
pub fn set_hub_stats(stats: &HubStats) {
    gauge!(names::TOPICS_ACTIVE).set(stats.topics as f64);
    gauge!(names::PROXIES_ACTIVE).set(stats.proxies as f64);
    gauge!(names::SESSIONS_ACTIVE).set(stats.sessions as f64);
}

/// Update the node health gauges.
pub fn set_cluster_health<'a>(nodes: impl Iterator<Item = (&'a str, NodeHealth)>) {
    let (mut up, mut suspect, mut down) = (0.0, 0.0, 0.0);
    for (_, health) in nodes {
        match health {
            NodeHealth::Up => up += 1.0,
            NodeHealth::Suspect => suspect += 1.0,
            NodeHealth::Down => down += 1.0,
        }
    }
    gauge!(names::CLUSTER_NODES, "health" => "up").set(up);
    gauge!(names::CLUSTER_NODES, "health" => "suspect").set(suspect);
    gauge!(names::CLUSTER_NODES, "health" => "down").set(down);
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
