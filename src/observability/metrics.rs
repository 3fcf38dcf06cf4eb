//! Metrics collection and exposition.
//!
//! # Metrics
//! - `netloop_bytes_read_total` (counter): raw bytes read from sockets
//! - `netloop_bytes_written_total` (counter): raw bytes written to sockets
//! - `netloop_connections_total` (counter): by `event` (bound, accepted, connected, closed)
//! - `netloop_loop_errors_total` (counter): failed event loop iterations
//! - `netloop_open_channels` (gauge): channels currently in the table
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Exporter is optional; without it every call is a no-op

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::ObservabilityConfig;

/// Install the Prometheus exporter if metrics are enabled.
pub fn init_metrics(config: &ObservabilityConfig) {
    if !config.metrics_enabled {
        return;
    }
    let addr: SocketAddr = match config.metrics_address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(
                metrics_address = %config.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            );
            return;
        }
    };

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_bytes_read(bytes: usize) {
    ::metrics::counter!("netloop_bytes_read_total").increment(bytes as u64);
}

pub fn record_bytes_written(bytes: usize) {
    ::metrics::counter!("netloop_bytes_written_total").increment(bytes as u64);
}

pub fn record_connection_event(event: &'static str) {
    ::metrics::counter!("netloop_connections_total", "event" => event).increment(1);
}

pub fn record_loop_error() {
    ::metrics::counter!("netloop_loop_errors_total").increment(1);
}

pub fn set_open_channels(count: usize) {
    ::metrics::gauge!("netloop_open_channels").set(count as f64);
}
