//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_proxy_requests_total` (counter): proxied requests by method,
//!   status, agent host
//! - `gateway_proxy_request_duration_seconds` (histogram): round-trip latency
//! - `gateway_tunnels_active` (gauge): currently registered tunnels
//! - `gateway_peer_forwards_total` (counter): requests forwarded to peers
//! - `agent_dispatches_total` (counter): pull-back dispatches by status

use std::sync::OnceLock;
use std::time::Instant;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide Prometheus recorder (idempotent) and return the
/// handle used to render `/.sys/metrics`.
pub fn install() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone()
}

pub fn record_proxy_request(method: &str, status: u16, agent: &str, started: Instant) {
    metrics::counter!(
        "gateway_proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "agent" => agent.to_string(),
    )
    .increment(1);
    metrics::histogram!("gateway_proxy_request_duration_seconds")
        .record(started.elapsed().as_secs_f64());
}

pub fn record_peer_forward(peer: &str) {
    metrics::counter!("gateway_peer_forwards_total", "peer" => peer.to_string()).increment(1);
}

pub fn tunnel_opened() {
    metrics::gauge!("gateway_tunnels_active").increment(1.0);
}

pub fn tunnel_closed() {
    metrics::gauge!("gateway_tunnels_active").decrement(1.0);
}

pub fn record_agent_dispatch(status: u16, started: Instant) {
    metrics::counter!("agent_dispatches_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("agent_dispatch_duration_seconds").record(started.elapsed().as_secs_f64());
}
