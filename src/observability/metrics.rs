//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define restart/drain metrics (connections, forks, forced releases)
//! - Optionally expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `grace_connections_accepted_total` (counter): connections accepted
//! - `grace_active_connections` (gauge): outstanding connections in this process
//! - `grace_forced_releases_total` (counter): connections abandoned by a drain timeout
//! - `grace_forks_total` (counter): replacement processes spawned
//! - `grace_fork_failures_total` (counter): failed restart attempts
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until an
//!   exporter is installed
//! - The exporter binds its own port, which a child cannot inherit; it is off
//!   unless an address is configured

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
///
/// Failure is logged and otherwise ignored; metrics are never worth an outage.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::warn!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn connection_opened() {
    ::metrics::counter!("grace_connections_accepted_total").increment(1);
    ::metrics::gauge!("grace_active_connections").increment(1.0);
}

pub fn connection_closed() {
    ::metrics::gauge!("grace_active_connections").decrement(1.0);
}

pub fn connections_force_released(count: u64) {
    ::metrics::counter!("grace_forced_releases_total").increment(count);
    ::metrics::gauge!("grace_active_connections").decrement(count as f64);
}

pub fn fork_spawned() {
    ::metrics::counter!("grace_forks_total").increment(1);
}

pub fn fork_failed(reason: &'static str) {
    ::metrics::counter!("grace_fork_failures_total", "reason" => reason).increment(1);
}
