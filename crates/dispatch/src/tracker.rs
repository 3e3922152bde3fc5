//! Campaign progress and admission control
//!
//! `ProgressTracker` owns the `CampaignState` for one campaign. Workers ask it
//! for admission before touching a resource: admission reserves one in-flight
//! slot, and the reservation is settled exactly once, either by recording a
//! `WorkResult` or by being dropped unused. Because reservations count against
//! the goal, `completed` can never overshoot it.
//!
//! Counters sit behind a short-held lock; `snapshot` never waits on a worker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use executor::{ErrorKind, Outcome};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::report::{as_opt_secs_f64, as_secs_f64};

/// Span used for `recent_rate_per_second`.
pub const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of one work item, after retries.
#[derive(Debug, Clone)]
pub struct WorkResult {
    pub resource_id: String,
    pub success: bool,
    pub retryable: bool,
    pub error_kind: Option<ErrorKind>,
    pub attempts: u32,
    pub timestamp: Instant,
}

impl WorkResult {
    pub fn new(resource_id: impl Into<String>, outcome: Outcome, attempts: u32) -> Self {
        let error_kind = outcome.error_kind();
        Self {
            resource_id: resource_id.into(),
            success: outcome.is_success(),
            retryable: error_kind.is_some_and(ErrorKind::is_retryable),
            error_kind,
            attempts,
            timestamp: Instant::now(),
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    GoalReached,
    Cancelled,
    Exhausted,
}

#[derive(Debug)]
struct CampaignState {
    target_count: u64,
    completed: u64,
    failed: u64,
    in_flight: u64,
    started_at: Instant,
    finished_at: Option<Instant>,
    cancelled: bool,
}

struct Inner {
    state: CampaignState,
    /// Completion instants within the trailing history window
    history: VecDeque<Instant>,
}

/// Point-in-time view of a campaign.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub goal: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
    /// Completed per second since start
    pub rate_per_second: f64,
    /// Completed per second over the history window
    pub recent_rate_per_second: f64,
    #[serde(rename = "elapsed_secs", serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    #[serde(rename = "eta_secs", serialize_with = "as_opt_secs_f64")]
    pub eta: Option<Duration>,
    pub cancelled: bool,
    pub finished: bool,
}

/// Result of asking for admission.
pub enum Admission {
    Proceed(Reservation),
    Stop(StopReason),
}

/// One in-flight slot. Settled by `record`; dropping it releases the slot.
pub struct Reservation {
    tracker: Arc<ProgressTracker>,
    settled: bool,
}

impl Reservation {
    pub fn record(mut self, result: WorkResult) {
        self.settled = true;
        self.tracker.record(result);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.abandon();
        }
    }
}

pub struct ProgressTracker {
    inner: Mutex<Inner>,
    history_window: Duration,
    changed: Notify,
    cancel: CancellationToken,
}

impl ProgressTracker {
    pub fn new(target_count: u64, history_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CampaignState {
                    target_count,
                    completed: 0,
                    failed: 0,
                    in_flight: 0,
                    started_at: Instant::now(),
                    finished_at: None,
                    cancelled: false,
                },
                history: VecDeque::new(),
            }),
            history_window,
            changed: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for permission to start one work item.
    ///
    /// Stops once the goal is met or the campaign is cancelled. While the
    /// remaining goal is fully covered by in-flight work, waits for one of
    /// those items to settle instead of overshooting.
    pub async fn admit(self: &Arc<Self>) -> Admission {
        loop {
            let changed = self.changed.notified();
            {
                let mut inner = self.lock();
                let state = &mut inner.state;
                if state.cancelled {
                    return Admission::Stop(StopReason::Cancelled);
                }
                if state.completed >= state.target_count {
                    return Admission::Stop(StopReason::GoalReached);
                }
                if state.completed + state.in_flight < state.target_count {
                    state.in_flight += 1;
                    return Admission::Proceed(Reservation {
                        tracker: Arc::clone(self),
                        settled: false,
                    });
                }
            }
            tokio::select! {
                _ = changed => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    fn abandon(&self) {
        {
            let mut inner = self.lock();
            inner.state.in_flight = inner.state.in_flight.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }

    fn record(&self, result: WorkResult) {
        {
            let mut inner = self.lock();
            let now = Instant::now();
            let state = &mut inner.state;
            state.in_flight = state.in_flight.saturating_sub(1);
            if result.success {
                state.completed += 1;
            } else {
                state.failed += 1;
            }
            if state.finished_at.is_some() {
                debug!(resource_id = %result.resource_id, "result recorded after campaign froze");
            }
            if result.success {
                inner.history.push_back(result.timestamp);
            }
            while let Some(&oldest) = inner.history.front() {
                if now.duration_since(oldest) > self.history_window {
                    inner.history.pop_front();
                } else {
                    break;
                }
            }
        }
        self.changed.notify_waiters();
    }

    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        self.lock().state.cancelled = true;
        self.cancel.cancel();
        self.changed.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires on `cancel`, for racing against waits.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the clock. Elapsed time and rates no longer advance.
    pub fn freeze(&self) {
        let mut inner = self.lock();
        if inner.state.finished_at.is_none() {
            inner.state.finished_at = Some(Instant::now());
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.lock();
        let state = &inner.state;
        let end = state.finished_at.unwrap_or_else(Instant::now);
        let elapsed = end.duration_since(state.started_at);
        let elapsed_secs = elapsed.as_secs_f64();

        let rate_per_second = if elapsed_secs > 0.0 {
            state.completed as f64 / elapsed_secs
        } else {
            0.0
        };

        let recent_span = elapsed.min(self.history_window).as_secs_f64();
        let recent = inner
            .history
            .iter()
            .filter(|&&t| end.duration_since(t) <= self.history_window)
            .count();
        let recent_rate_per_second = if recent_span > 0.0 {
            recent as f64 / recent_span
        } else {
            0.0
        };

        let remaining = state.target_count.saturating_sub(state.completed);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if rate_per_second > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate_per_second))
        } else {
            None
        };

        ProgressSnapshot {
            goal: state.target_count,
            completed: state.completed,
            failed: state.failed,
            in_flight: state.in_flight,
            rate_per_second,
            recent_rate_per_second,
            elapsed,
            eta,
            cancelled: state.cancelled,
            finished: state.finished_at.is_some(),
        }
    }
}
