//! Prometheus metrics helpers for the statsync reconciler.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across statsync components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use statsync_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     use metrics::counter;
//!     counter!("listener_events_received_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`listener_`, `cascade_`, `association_`, `resync_`, `series_`)
//! - Suffix: unit or type (`_total`, `_seconds`, `_unix`)
//! - Labels: only low-cardinality values (`kind`, `action`, `outcome`), never entity ids

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:<port>` and serves `/metrics` from a background task.
/// Returns once the listener is bound, so a port conflict surfaces here.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics used across statsync.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Event Listener
    // =========================================================================

    describe_counter!(
        "listener_events_received_total",
        "Total change-feed messages received"
    );
    describe_counter!(
        "listener_events_dispatched_total",
        "Change events dispatched to the reconciler (label: action)"
    );
    describe_counter!(
        "listener_events_ignored_total",
        "Change events with no reconciliation action"
    );
    describe_counter!(
        "listener_events_malformed_total",
        "Change-feed messages that could not be decoded"
    );
    describe_gauge!(
        "listener_inflight_actions",
        "Reconciler actions currently running"
    );
    describe_gauge!(
        "listener_running",
        "Whether the event listener is running (1=yes, 0=no)"
    );

    // =========================================================================
    // Cascades and Associations
    // =========================================================================

    describe_counter!(
        "cascade_runs_total",
        "Cascade deletions started (label: scope)"
    );
    describe_counter!(
        "cascade_resolution_errors_total",
        "Cascade deletions aborted because the hierarchy could not be resolved"
    );
    describe_counter!(
        "association_ops_total",
        "Association sub-operations (labels: kind, outcome)"
    );
    describe_counter!(
        "association_rows_deleted_total",
        "Association rows removed (label: kind)"
    );

    // =========================================================================
    // Full Resync
    // =========================================================================

    describe_counter!("resync_runs_total", "Full resynchronization sweeps started");
    describe_counter!(
        "resync_sensors_total",
        "Sensors reconciled during full resync (label: action)"
    );
    describe_histogram!(
        "resync_duration_seconds",
        "Wall-clock duration of a full resync"
    );
    describe_gauge!(
        "resync_in_progress",
        "Whether a full resync is running (1=yes, 0=no)"
    );
    describe_gauge!(
        "resync_last_run_unix",
        "Unix timestamp of the last completed full resync"
    );

    // =========================================================================
    // Time Series
    // =========================================================================

    describe_counter!(
        "series_values_inserted_total",
        "Time-series observations inserted"
    );
    describe_counter!(
        "series_insert_errors_total",
        "Time-series inserts rejected by the store"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter carrying a single label.
///
/// # Example
///
/// ```rust,ignore
/// use statsync_core::metrics::increment_labeled;
///
/// increment_labeled("resync_sensors_total", "action", "created", 1);
/// ```
pub fn increment_labeled(
    name: &'static str,
    label: &'static str,
    value: &'static str,
    count: u64,
) {
    metrics::counter!(name, label => value).increment(count);
}

/// Increment a counter.
///
/// Convenience wrapper around `metrics::counter!`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
///
/// Convenience wrapper around `metrics::gauge!`.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
