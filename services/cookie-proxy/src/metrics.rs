//! Prometheus metrics exposition
//!
//! - `proxy_attempts_total` (counter): labels `status`, `method`, `outcome`
//! - `proxy_attempt_duration_seconds` (histogram): label `status`
//! - `session_refresh_total` (counter): label `outcome`, recorded by the
//!   refresh coordinator
//! - `session_token_valid` (gauge): 1 while the stored session is usable

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::proxy::AttemptRecord;

/// Histogram buckets from 5ms to 60s, covering the request timeout range.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_attempt_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `proxy_attempt_duration_seconds` is configured with explicit buckets so it
/// renders as a histogram (with `_bucket` lines) rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record one upstream attempt. Transport failures carry status `0`.
pub fn record_attempt(attempt: &AttemptRecord) {
    let status_str = attempt.status.unwrap_or(0).to_string();
    metrics::counter!(
        "proxy_attempts_total",
        "status" => status_str.clone(),
        "method" => attempt.method.clone(),
        "outcome" => attempt.outcome,
    )
    .increment(1);
    metrics::histogram!("proxy_attempt_duration_seconds", "status" => status_str)
        .record(attempt.duration.as_secs_f64());
}

pub fn set_session_valid(valid: bool) {
    metrics::gauge!("session_token_valid").set(if valid { 1.0 } else { 0.0 });
}
