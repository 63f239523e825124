//! Prometheus metrics exposition
//!
//! The gateway records `gateway_requests_total` (labels `status`, `operation`).
//! The dispatcher and pool crates record their own series through the same
//! global recorder:
//!
//! - `dispatch_attempts_total` (counter): labels `operation`, `result`
//! - `dispatch_outcomes_total` (counter): labels `operation`, `outcome`
//! - `dispatch_duration_seconds` (histogram): label `outcome`
//! - `credential_rotations_total` (counter): label `mode`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bounds for `dispatch_duration_seconds`, 5ms to 120s.
///
/// The top end covers a full retry budget of 30s attempts with backoff.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("dispatch_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a finished gateway request.
pub fn record_request(status: u16, operation: &str) {
    metrics::counter!(
        "gateway_requests_total",
        "status" => status.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
