//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Name every transport metric in one place
//! - Provide cheap recording helpers for the rest of the crate
//! - Install the Prometheus exporter when enabled
//!
//! # Metrics
//! - `transport_connections_accepted_total` (counter)
//! - `transport_connections_rejected_total` (counter): over the connection limit
//! - `transport_active_connections` (gauge)
//! - `transport_connections_closed_total` (counter): by outcome
//! - `transport_connection_aborts_total` (counter): by reason
//! - `transport_pool_rent_total` / `transport_pool_return_total` (counters): by pool, result
//! - `transport_drain_total` (counter): by outcome
//! - `transport_accept_errors_total` (counter)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every helper is a no-op

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Metric names used throughout the crate.
pub mod names {
    pub const CONNECTIONS_ACCEPTED: &str = "transport_connections_accepted_total";
    pub const CONNECTIONS_REJECTED: &str = "transport_connections_rejected_total";
    pub const ACTIVE_CONNECTIONS: &str = "transport_active_connections";
    pub const CONNECTIONS_CLOSED: &str = "transport_connections_closed_total";
    pub const CONNECTION_ABORTS: &str = "transport_connection_aborts_total";
    pub const POOL_RENT: &str = "transport_pool_rent_total";
    pub const POOL_RETURN: &str = "transport_pool_return_total";
    pub const DRAIN: &str = "transport_drain_total";
    pub const ACCEPT_ERRORS: &str = "transport_accept_errors_total";
}

/// Install the Prometheus exporter with an HTTP scrape endpoint at `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn describe_metrics() {
    describe_counter!(names::CONNECTIONS_ACCEPTED, "Connections accepted");
    describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections rejected over the connection limit"
    );
    describe_gauge!(names::ACTIVE_CONNECTIONS, "Connections currently open");
    describe_counter!(names::CONNECTIONS_CLOSED, "Connections torn down, by outcome");
    describe_counter!(names::CONNECTION_ABORTS, "Connection aborts, by reason");
    describe_counter!(names::POOL_RENT, "Pool rents, by pool and hit/miss");
    describe_counter!(names::POOL_RETURN, "Pool returns, by pool and result");
    describe_counter!(names::DRAIN, "Shutdown drains, by outcome");
    describe_counter!(names::ACCEPT_ERRORS, "Transient accept failures");
}

pub fn record_connection_accepted() {
    counter!(names::CONNECTIONS_ACCEPTED).increment(1);
    gauge!(names::ACTIVE_CONNECTIONS).increment(1.0);
}

pub fn record_connection_rejected() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// A connection reached a terminal state.
pub fn record_connection_closed(outcome: &'static str) {
    counter!(names::CONNECTIONS_CLOSED, "outcome" => outcome).increment(1);
    gauge!(names::ACTIVE_CONNECTIONS).decrement(1.0);
}

pub fn record_connection_abort(reason: &'static str) {
    counter!(names::CONNECTION_ABORTS, "reason" => reason).increment(1);
}

pub fn record_pool_rent(pool: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(names::POOL_RENT, "pool" => pool, "result" => result).increment(1);
}

pub fn record_pool_return(pool: &'static str, result: &'static str) {
    counter!(names::POOL_RETURN, "pool" => pool, "result" => result).increment(1);
}

pub fn record_drain(outcome: &'static str) {
    counter!(names::DRAIN, "outcome" => outcome).increment(1);
}

pub fn record_accept_error() {
    counter!(names::ACCEPT_ERRORS).increment(1);
}
