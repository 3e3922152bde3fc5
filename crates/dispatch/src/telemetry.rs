//! Prometheus-style metrics emitted by the dispatcher
//!
//! - `campaign_attempts_total` (counter): label `outcome`
//! - `campaign_execute_duration_seconds` (histogram)
//! - `campaign_results_total` (counter): label `status`
//! - `campaign_active_workers` (gauge)
//!
//! Without an installed recorder these calls are no-ops.

use executor::Outcome;

pub const EXECUTE_DURATION_METRIC: &str = "campaign_execute_duration_seconds";

/// Record one executor call (a retry counts as its own attempt).
pub fn record_attempt(outcome: Outcome, duration_secs: f64) {
    metrics::counter!("campaign_attempts_total", "outcome" => outcome.label()).increment(1);
    metrics::histogram!(EXECUTE_DURATION_METRIC).record(duration_secs);
}

/// Record one finished work item after retries.
pub fn record_result(success: bool) {
    let status = if success { "completed" } else { "failed" };
    metrics::counter!("campaign_results_total", "status" => status).increment(1);
}

pub fn worker_started() {
    metrics::gauge!("campaign_active_workers").increment(1.0);
}

pub fn worker_stopped() {
    metrics::gauge!("campaign_active_workers").decrement(1.0);
}
