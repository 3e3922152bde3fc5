//! Prometheus metrics exposition
//!
//! The dispatcher and pool emit through the `metrics` facade:
//!
//! - `campaign_attempts_total` (counter): label `outcome`
//! - `campaign_results_total` (counter): label `status`
//! - `campaign_execute_duration_seconds` (histogram)
//! - `campaign_rate_limit_penalties_total` (counter)
//! - `campaign_active_workers` (gauge)
//! - `pool_resources_retired_total` (counter): label `reason`
//!
//! This module installs the recorder that renders them on `/metrics`.

use dispatch::telemetry::EXECUTE_DURATION_METRIC;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Buckets from 10ms to 60s, the range of one executor call up to the
/// longest sensible attempt timeout.
const EXECUTE_BUCKETS: &[f64] = &[
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(EXECUTE_DURATION_METRIC.to_string()),
        EXECUTE_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Explicit buckets make the duration metric render as a histogram with
/// `_bucket` lines rather than the default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
