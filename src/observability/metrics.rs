//! Metrics collection and exposition.
//!
//! # Metrics
//! - `vmnet_bytes_sent` (gauge): bytes written to the guest
//! - `vmnet_bytes_received` (gauge): bytes read from the guest
//! - `vmnet_http_requests_total` (counter): requests by surface and status
//!
//! Without an installed exporter the macros are no-ops.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::vnet::CounterSnapshot;

pub const BYTES_SENT: &str = "vmnet_bytes_sent";
pub const BYTES_RECEIVED: &str = "vmnet_bytes_received";
pub const HTTP_REQUESTS: &str = "vmnet_http_requests_total";

/// Install the Prometheus exporter, serving scrapes on `addr`.
///
/// Must be called inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Publish the stack's byte counters.
pub fn record_bytes(snapshot: CounterSnapshot) {
    ::metrics::gauge!(BYTES_SENT).set(snapshot.bytes_sent as f64);
    ::metrics::gauge!(BYTES_RECEIVED).set(snapshot.bytes_received as f64);
}

/// Count one handled HTTP request.
pub fn record_request(surface: &'static str, status: u16) {
    ::metrics::counter!(HTTP_REQUESTS, "surface" => surface, "status" => status.to_string())
        .increment(1);
}
