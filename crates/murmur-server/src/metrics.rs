//! Metrics collection and export for Murmur.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use murmur_core::{HubHandle, HubStats, RejectReason};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "murmur_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "murmur_connections_active";
    pub const MEMBERS: &str = "murmur_members";
    pub const REJECTIONS_TOTAL: &str = "murmur_rejections_total";
    pub const EVICTIONS_TOTAL: &str = "murmur_evictions_total";
    pub const EVENTS_FANNED_OUT: &str = "murmur_events_fanned_out_total";
    pub const DISCONNECTS_TOTAL: &str = "murmur_disconnects_total";
    pub const ERRORS_TOTAL: &str = "murmur_errors_total";
}

/// Register metric descriptions with the installed recorder.
fn describe_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of upgraded connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of upgraded connections"
    );
    metrics::describe_gauge!(names::MEMBERS, "Connections registered with the hub");
    metrics::describe_counter!(names::REJECTIONS_TOTAL, "Admissions refused by the hub");
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections evicted for falling behind"
    );
    metrics::describe_counter!(names::EVENTS_FANNED_OUT, "Events fanned out by the hub");
    metrics::describe_counter!(names::DISCONNECTS_TOTAL, "Connection teardowns by cause");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
}

/// Install the Prometheus recorder, start its HTTP listener and describe
/// every metric.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;
    // Descriptions only reach a recorder that is already installed.
    describe_metrics();

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

/// Record a refused admission.
pub fn record_rejection(reason: RejectReason) {
    let reason = match reason {
        RejectReason::Capacity => "capacity",
        RejectReason::HistoryOverrun => "history_overrun",
    };
    counter!(names::REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record why a pumped connection ended.
pub fn record_teardown(kind: &'static str) {
    counter!(names::DISCONNECTS_TOTAL, "cause" => kind).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish a hub statistics snapshot.
#[allow(clippy::cast_precision_loss)]
pub fn record_stats(stats: &HubStats) {
    gauge!(names::MEMBERS).set(stats.members as f64);
    counter!(names::EVICTIONS_TOTAL).absolute(stats.evicted_total);
    counter!(names::EVENTS_FANNED_OUT).absolute(stats.events_fanned_out);
}

/// Poll the hub for statistics every `period` until the hub shuts down.
pub fn spawn_stats_reporter(hub: HubHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match hub.stats().await {
                Ok(stats) => record_stats(&stats),
                Err(e) => {
                    debug!(error = %e, "Stats reporter stopping");
                    break;
                }
            }
        }
    })
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
