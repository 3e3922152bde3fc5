//! Bounded retry around a single executor call
//!
//! Only `Transient` and `RateLimited` failures are retried. Every retry waits
//! out a backoff delay and then takes a fresh rate-limit slot, so retries are
//! throttled like first attempts. A `RateLimited` failure also penalizes the
//! shared limiter. No retry starts once the campaign is cancelled.

use std::time::Duration;

use common::Backoff;
use executor::{ActionExecutor, Credential, ErrorKind, Outcome, Target};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::limiter::RateLimiter;
use crate::telemetry;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Upper bound on one executor call; hitting it counts as `Transient`
    pub attempt_timeout: Duration,
    /// Factor passed to `RateLimiter::penalize` on `RateLimited`
    pub penalty_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            attempt_timeout: Duration::from_secs(30),
            penalty_factor: 0.5,
        }
    }
}

/// Final outcome of a work item and how many executor calls it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempted {
    pub outcome: Outcome,
    pub attempts: u32,
}

/// Run `executor` for one credential/target pair.
///
/// The caller must already hold a rate-limit slot for the first attempt.
pub async fn execute_with_retry(
    executor: &dyn ActionExecutor,
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    credential: &Credential,
    target: &Target,
    cancel: &CancellationToken,
) -> Attempted {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            policy.attempt_timeout,
            executor.execute(credential, target),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(
                    resource_id = %credential.id,
                    timeout_ms = policy.attempt_timeout.as_millis() as u64,
                    "attempt timed out"
                );
                Outcome::Failure(ErrorKind::Transient)
            }
        };
        telemetry::record_attempt(outcome, started.elapsed().as_secs_f64());

        let kind = match outcome {
            Outcome::Success => return Attempted { outcome, attempts },
            Outcome::Failure(kind) => kind,
        };
        if kind == ErrorKind::RateLimited {
            limiter.penalize(policy.penalty_factor);
        }
        if !kind.is_retryable() || attempts >= max_attempts || cancel.is_cancelled() {
            return Attempted { outcome, attempts };
        }

        let delay = policy.backoff.delay(attempts - 1);
        debug!(
            resource_id = %credential.id,
            attempt = attempts,
            kind = kind.label(),
            delay_ms = delay.as_millis() as u64,
            "retrying after backoff"
        );

        let ready = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = async {
                tokio::time::sleep(delay).await;
                limiter.acquire_slot().await;
            } => true,
        };
        if !ready || cancel.is_cancelled() {
            return Attempted { outcome, attempts };
        }
    }
}
