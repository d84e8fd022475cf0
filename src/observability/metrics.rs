//! Metrics collection and exposition.
//!
//! # Metrics
//! - `upstream_requests_total` (counter): requests queued to an origin
//! - `upstream_requests_written_total` (counter): requests written to a connection
//! - `upstream_requests_aborted_total` (counter): aborted requests, by error kind
//! - `upstream_requests_active` (gauge): live server-side requests
//! - `upstream_connections_active` (gauge): open or opening connections
//! - `upstream_restarts_total` (counter): transparent pipeline restarts
//! - `upstream_superseded_total` (counter): objects replaced by a newer instance
//! - `upstream_body_bytes_total` (counter): body bytes, by `path` (direct or indirect)
//! - `upstream_origins` (gauge): known origins

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::UpstreamError;

/// Install the Prometheus recorder and its scrape listener.
/// Must run inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn request_queued() {
    counter!("upstream_requests_total").increment(1);
    gauge!("upstream_requests_active").increment(1.0);
}

pub fn request_written() {
    counter!("upstream_requests_written_total").increment(1);
}

pub fn request_aborted(err: &UpstreamError) {
    counter!(
        "upstream_requests_aborted_total",
        "kind" => err.kind(),
        "status" => err.status().as_u16().to_string()
    )
    .increment(1);
}

pub fn request_destroyed() {
    gauge!("upstream_requests_active").decrement(1.0);
}

pub fn connection_opened() {
    gauge!("upstream_connections_active").increment(1.0);
}

pub fn connection_closed() {
    gauge!("upstream_connections_active").decrement(1.0);
}

pub fn restart() {
    counter!("upstream_restarts_total").increment(1);
}

pub fn superseded() {
    counter!("upstream_superseded_total").increment(1);
}

pub fn bytes_direct(n: usize) {
    counter!("upstream_body_bytes_total", "path" => "direct").increment(n as u64);
}

pub fn bytes_indirect(n: usize) {
    counter!("upstream_body_bytes_total", "path" => "indirect").increment(n as u64);
}

pub fn set_origins(n: usize) {
    gauge!("upstream_origins").set(n as f64);
}
