//! Metrics collection and exposition.
//!
//! # Metrics
//! - `socket_link_connections_opened_total` (counter): by role
//! - `socket_link_connections_closed_total` (counter): by role
//! - `socket_link_frames_sent_total` (counter): by kind
//! - `socket_link_frames_received_total` (counter): by kind
//! - `socket_link_protocol_faults_total` (counter): by kind
//! - `socket_link_watchdog_expired_total` (counter)
//! - `socket_link_server_active_connections` (gauge)
//! - `socket_link_server_transitions_total` (counter): by target status
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with an HTTP scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_opened(role: &'static str) {
    metrics::counter!("socket_link_connections_opened_total", "role" => role).increment(1);
}

pub fn record_connection_closed(role: &'static str) {
    metrics::counter!("socket_link_connections_closed_total", "role" => role).increment(1);
}

pub fn record_frame_sent(kind: &'static str) {
    metrics::counter!("socket_link_frames_sent_total", "kind" => kind).increment(1);
}

pub fn record_frame_received(kind: &'static str) {
    metrics::counter!("socket_link_frames_received_total", "kind" => kind).increment(1);
}

pub fn record_protocol_fault(kind: &'static str) {
    metrics::counter!("socket_link_protocol_faults_total", "kind" => kind).increment(1);
}

pub fn record_watchdog_expired() {
    metrics::counter!("socket_link_watchdog_expired_total").increment(1);
}

pub fn record_active_connections(count: usize) {
    metrics::gauge!("socket_link_server_active_connections").set(count as f64);
}

pub fn record_server_transition(status: &'static str) {
    metrics::counter!("socket_link_server_transitions_total", "status" => status).increment(1);
}
