//! Prometheus metrics registry and recorders.

use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all Cadenza metrics
const PREFIX: &str = "cadenza";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Dependency Health Metrics
    pub static ref DEPENDENCY_UP: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_dependency_up"), "Whether a dependency passed its last health check"),
        &["component"]
    ).expect("Failed to create dependency_up metric");

    // Leadership Metrics
    pub static ref IS_LEADER: Gauge = Gauge::new(
        format!("{PREFIX}_is_leader"),
        "Whether this replica currently holds leadership"
    ).expect("Failed to create is_leader metric");

    // Ingestion Metrics
    pub static ref RECONCILE_EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_reconcile_events_total"), "Change events processed by the reconciliation pipeline"),
        &["action", "outcome"]
    ).expect("Failed to create reconcile_events_total metric");

    pub static ref CATALOG_TRACKS: Gauge = Gauge::new(
        format!("{PREFIX}_catalog_tracks"),
        "Number of tracks in the catalog"
    ).expect("Failed to create catalog_tracks metric");
}

/// Register all metrics with the global registry. Safe to call more than
/// once; duplicate registrations are ignored.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(DEPENDENCY_UP.clone()));
    let _ = REGISTRY.register(Box::new(IS_LEADER.clone()));
    let _ = REGISTRY.register(Box::new(RECONCILE_EVENTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CATALOG_TRACKS.clone()));
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn set_component_health(component: &str, healthy: bool) {
    DEPENDENCY_UP
        .with_label_values(&[component])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn set_leader(is_leader: bool) {
    IS_LEADER.set(if is_leader { 1.0 } else { 0.0 });
}

pub fn record_reconcile(action: &str, outcome: &str) {
    RECONCILE_EVENTS_TOTAL
        .with_label_values(&[action, outcome])
        .inc();
}

pub fn set_catalog_tracks(count: usize) {
    CATALOG_TRACKS.set(count as f64);
}

/// Handler for GET /metrics (Prometheus text format).
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [("content-type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
