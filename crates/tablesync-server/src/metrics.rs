//! Metrics collection and export for tablesync.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tablesync_core::{BroadcastReport, HostStats};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tablesync_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tablesync_connections_active";
    pub const FRAMES_TOTAL: &str = "tablesync_frames_total";
    pub const BINARY_BYTES: &str = "tablesync_binary_bytes_total";
    pub const REQUESTS_TOTAL: &str = "tablesync_requests_total";
    pub const REQUEST_SECONDS: &str = "tablesync_request_seconds";
    pub const TABLES_ACTIVE: &str = "tablesync_tables_active";
    pub const VIEWS_ACTIVE: &str = "tablesync_views_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "tablesync_subscriptions_active";
    pub const PUSHES_TOTAL: &str = "tablesync_pushes_total";
    pub const DELTA_FAILURES_TOTAL: &str = "tablesync_delta_failures_total";
    pub const ERRORS_TOTAL: &str = "tablesync_errors_total";
}

/// Describe every metric.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames sent and received");
    metrics::describe_counter!(names::BINARY_BYTES, "Columnar bytes sent and received");
    metrics::describe_counter!(names::REQUESTS_TOTAL, "Requests handled, by method");
    metrics::describe_histogram!(names::REQUEST_SECONDS, "Request handling time in seconds");
    metrics::describe_gauge!(names::TABLES_ACTIVE, "Currently hosted tables");
    metrics::describe_gauge!(names::VIEWS_ACTIVE, "Currently open views");
    metrics::describe_gauge!(names::SUBSCRIPTIONS_ACTIVE, "Currently active subscriptions");
    metrics::describe_counter!(names::PUSHES_TOTAL, "Update pushes queued to subscribers");
    metrics::describe_counter!(
        names::DELTA_FAILURES_TOTAL,
        "Views whose delta could not be computed"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a frame and the size of its binary block.
pub fn record_frame(direction: &'static str, binary_len: usize) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    if binary_len > 0 {
        counter!(names::BINARY_BYTES, "direction" => direction).increment(binary_len as u64);
    }
}

/// Record a handled request.
pub fn record_request(method: &'static str, seconds: f64) {
    counter!(names::REQUESTS_TOTAL, "method" => method).increment(1);
    histogram!(names::REQUEST_SECONDS, "method" => method).record(seconds);
}

/// Record the outcome of one update's broadcast.
pub fn record_broadcast(report: &BroadcastReport) {
    counter!(names::PUSHES_TOTAL).increment(report.notified as u64);
    if report.failed > 0 {
        counter!(names::DELTA_FAILURES_TOTAL).increment(report.failed as u64);
    }
}

/// Publish host-wide gauges.
pub fn set_host_stats(stats: &HostStats) {
    gauge!(names::TABLES_ACTIVE).set(stats.tables as f64);
    gauge!(names::VIEWS_ACTIVE).set(stats.views as f64);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.subscriptions.subscriptions as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Counts a connection while alive.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
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
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder is installed; every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_frame("inbound", 16);
        record_request("open_table", 0.001);
        record_broadcast(&BroadcastReport::default());
        record_error("protocol");
    }
}
