//! Prometheus Metrics Module
//!
//! Pre-registered metrics for production observability, exposed as text on
//! the handler's `/metrics` endpoint.

use lazy_static::lazy_static;
use prometheus::{
    opts, register_histogram, register_int_counter_vec, Encoder, Histogram, IntCounterVec,
    TextEncoder,
};

use crate::engine::SweepReport;
use crate::orders::ServiceType;

lazy_static! {
    /// Panel submissions (by service type and outcome)
    pub static ref SUBMITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("panelbridge_submits_total", "Panel order submissions"),
        &["service", "status"]
    ).expect("FATAL: Failed to register SUBMITS_TOTAL metric - check for duplicate registration");

    /// Panel status polls (by outcome)
    pub static ref POLLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("panelbridge_polls_total", "Panel status polls"),
        &["status"]
    ).expect("FATAL: Failed to register POLLS_TOTAL metric - check for duplicate registration");

    /// Per-sweep order outcomes
    pub static ref SWEEP_ORDERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("panelbridge_sweep_orders_total", "Orders visited by sweeps"),
        &["outcome"]
    ).expect("FATAL: Failed to register SWEEP_ORDERS_TOTAL metric - check for duplicate registration");

    /// Sweep wall-clock duration in seconds
    pub static ref SWEEP_DURATION: Histogram = register_histogram!(
        "panelbridge_sweep_duration_seconds",
        "Sweep duration",
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 180.0, 300.0]
    ).expect("FATAL: Failed to register SWEEP_DURATION metric - check for duplicate registration");
}

/// Record a panel submission attempt.
pub fn record_submit(service: ServiceType, success: bool) {
    let status = if success { "success" } else { "failure" };
    SUBMITS_TOTAL
        .with_label_values(&[&service.to_string(), status])
        .inc();
}

/// Record a panel status poll.
pub fn record_poll(success: bool) {
    let status = if success { "success" } else { "failure" };
    POLLS_TOTAL.with_label_values(&[status]).inc();
}

/// Record an entire sweep's aggregate outcome.
pub fn record_sweep(report: &SweepReport) {
    SWEEP_ORDERS_TOTAL
        .with_label_values(&["succeeded"])
        .inc_by(report.succeeded as u64);
    SWEEP_ORDERS_TOTAL
        .with_label_values(&["failed"])
        .inc_by(report.failed as u64);
    SWEEP_DURATION.observe(report.duration_ms as f64 / 1000.0);
}

/// Get metrics as text for /metrics endpoint.
///
/// Handles encoding errors gracefully instead of panicking.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode Prometheus metrics: {}", e);
        return String::new();
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Prometheus metrics buffer is not valid UTF-8: {}", e);
            String::new()
        }
    }
}
