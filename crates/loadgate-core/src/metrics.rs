//! Process-wide Prometheus metrics
//!
//! These mirror the run's live state for scraping or for a text dump at the
//! end of a run. They are registered lazily on first access and are never
//! consulted by the verdict, which uses the aggregator's snapshot.

use crate::outcome::OutcomeKind;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Encoder, Histogram,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Duration;

// ===== Request Metrics =====

/// Iterations by outcome kind
pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "loadgate_requests_total",
        "Total number of scenario iterations by outcome",
        &["outcome"]
    )
    .expect("Failed to register requests counter")
});

/// Main request latency
pub static REQUEST_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "loadgate_request_duration_seconds",
        "Main request duration in seconds",
        // Buckets: 5ms .. 60s
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 0.8, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register request duration histogram")
});

// ===== Health Probe Metrics =====

/// Liveness probes by result (healthy/unhealthy)
pub static HEALTH_PROBES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "loadgate_health_probes_total",
        "Total number of liveness probes by result",
        &["result"]
    )
    .expect("Failed to register health probe counter")
});

// ===== Concurrency Metrics =====

/// Virtual users currently executing iterations
pub static ACTIVE_VUS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "loadgate_active_vus",
        "Number of virtual users currently executing iterations"
    )
    .expect("Failed to register active VUs gauge")
});

/// Concurrency currently commanded by the ramp profile
pub static TARGET_VUS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "loadgate_target_vus",
        "Concurrency currently commanded by the ramp profile"
    )
    .expect("Failed to register target VUs gauge")
});

/// Record one finished iteration.
pub fn observe_outcome(kind: OutcomeKind, latency: Duration) {
    REQUESTS_TOTAL.with_label_values(&[kind.as_str()]).inc();
    if kind.is_request() {
        REQUEST_DURATION.observe(latency.as_secs_f64());
    }
}

pub fn observe_probe(healthy: bool) {
    let result = if healthy { "healthy" } else { "unhealthy" };
    HEALTH_PROBES_TOTAL.with_label_values(&[result]).inc();
}

/// All registered metrics in Prometheus text format.
pub fn export_prometheus() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to UTF-8: {}", e);
        String::from("# Error encoding metrics\n")
    })
}
