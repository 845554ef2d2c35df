use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::sync::LazyLock;

pub static NOTIFICATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paylock_notifications_total",
        "Inbound payment notifications",
        &["result"]
    )
    .unwrap()
});

pub static VERIFICATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paylock_verifications_total",
        "Payment verifications by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static ACTUATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paylock_actuations_total",
        "Lock commands sent to the vendor",
        &["command", "result"]
    )
    .unwrap()
});

pub static ACTUATION_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "paylock_actuation_duration_seconds",
        "Lock command latency in seconds",
        &["command"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap()
});

pub static CREDENTIAL_REFRESHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paylock_credential_refreshes_total",
        "Vendor token exchanges",
        &["result"]
    )
    .unwrap()
});

pub static SIGNATURE_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paylock_signature_failures_total",
        "Rejected webhook signatures",
        &["reason"]
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
