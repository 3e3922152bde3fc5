//! Long-lived workers that drive a campaign
//!
//! One tokio task per concurrency slot. Each loop iteration:
//! 1. Reserve an in-flight slot from the tracker (stops on goal or cancel)
//! 2. Lease a resource that has not yet acted on the target
//! 3. Wait for a rate-limit slot, racing cancellation
//! 4. Execute with bounded retry
//! 5. Release the lease with the outcome and record the result
//! 6. Sleep a short random jitter
//!
//! State transitions:
//!
//! ```text
//! Idle → AcquiringResource → RateLimited → Executing → Recording → Idle
//!   └─────────────┴───────────────┴──────────────────────────→ Stopped(reason)
//! ```

use std::sync::Arc;
use std::time::Duration;

use executor::{ActionExecutor, Target};
use rand::RngExt;
use resource_pool::ResourcePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace};

use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::report::{CampaignOutcome, CampaignReport};
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::telemetry;
use crate::tracker::{
    Admission, DEFAULT_HISTORY_WINDOW, ProgressSnapshot, ProgressTracker, StopReason, WorkResult,
};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub retry: RetryPolicy,
    /// Random pause after each work item, drawn from `jitter_min..=jitter_max`
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// How far back successes count toward the recent completion rate
    pub history_window: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(200),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

impl WorkerSettings {
    fn jitter(&self) -> Duration {
        let min = self.jitter_min.as_millis() as u64;
        let max = (self.jitter_max.as_millis() as u64).max(min);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    AcquiringResource,
    RateLimited,
    Executing,
    Recording,
    Stopped(StopReason),
}

impl WorkerState {
    pub fn label(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::AcquiringResource => "acquiring_resource",
            WorkerState::RateLimited => "rate_limited",
            WorkerState::Executing => "executing",
            WorkerState::Recording => "recording",
            WorkerState::Stopped(_) => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker: usize,
    pub stop_reason: StopReason,
    /// Work items this worker carried through execution
    pub executed: u64,
}

struct Worker {
    index: usize,
    target: Arc<Target>,
    pool: Arc<ResourcePool>,
    limiter: Arc<RateLimiter>,
    executor: Arc<dyn ActionExecutor>,
    settings: Arc<WorkerSettings>,
    tracker: Arc<ProgressTracker>,
    state: WorkerState,
}

impl Worker {
    fn transition(&mut self, next: WorkerState) {
        trace!(from = self.state.label(), to = next.label(), "worker state");
        self.state = next;
    }

    async fn run(mut self) -> WorkerSummary {
        telemetry::worker_started();
        let cancel = self.tracker.cancellation().clone();
        let mut executed = 0u64;

        let reason = loop {
            self.transition(WorkerState::Idle);
            let reservation = match self.tracker.admit().await {
                Admission::Proceed(reservation) => reservation,
                Admission::Stop(reason) => break reason,
            };

            self.transition(WorkerState::AcquiringResource);
            let Some(lease) = self.pool.acquire(&self.target.id).await else {
                drop(reservation);
                break StopReason::Exhausted;
            };

            self.transition(WorkerState::RateLimited);
            let admitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = self.limiter.acquire_slot() => true,
            };
            if !admitted || cancel.is_cancelled() {
                self.pool.return_unused(lease).await;
                break StopReason::Cancelled;
            }

            self.transition(WorkerState::Executing);
            let attempted = execute_with_retry(
                self.executor.as_ref(),
                &self.limiter,
                &self.settings.retry,
                lease.credential(),
                &self.target,
                &cancel,
            )
            .await;
            executed += 1;

            self.transition(WorkerState::Recording);
            let resource_id = lease.id().to_string();
            let disposition = self.pool.release(lease, attempted.outcome).await;
            telemetry::record_result(attempted.outcome.is_success());
            debug!(
                resource_id = %resource_id,
                outcome = attempted.outcome.label(),
                attempts = attempted.attempts,
                ?disposition,
                "work item finished"
            );
            reservation.record(WorkResult::new(
                resource_id,
                attempted.outcome,
                attempted.attempts,
            ));

            let pause = self.settings.jitter();
            if !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        };

        self.transition(WorkerState::Stopped(reason));
        telemetry::worker_stopped();
        debug!(?reason, executed, "worker stopped");
        WorkerSummary {
            worker: self.index,
            stop_reason: reason,
            executed,
        }
    }
}

/// Spawns workers over a shared pool, limiter and executor.
pub struct WorkerPool {
    pool: Arc<ResourcePool>,
    limiter: Arc<RateLimiter>,
    executor: Arc<dyn ActionExecutor>,
    settings: Arc<WorkerSettings>,
}

impl WorkerPool {
    pub fn new(
        pool: Arc<ResourcePool>,
        limiter: Arc<RateLimiter>,
        executor: Arc<dyn ActionExecutor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            pool,
            limiter,
            executor,
            settings: Arc::new(settings),
        }
    }

    /// Start `min(concurrency, goal, available resources)` workers.
    pub async fn start(
        &self,
        campaign_id: impl Into<String>,
        target: Target,
        goal: u64,
        concurrency: usize,
    ) -> CampaignHandle {
        let campaign_id = campaign_id.into();
        let available = self.pool.available_count().await;
        let worker_count = concurrency
            .min(usize::try_from(goal).unwrap_or(usize::MAX))
            .min(available);

        let tracker = Arc::new(ProgressTracker::new(goal, self.settings.history_window));
        let target = Arc::new(target);

        info!(
            campaign_id = %campaign_id,
            target_id = %target.id,
            goal,
            workers = worker_count,
            available_resources = available,
            executor = self.executor.id(),
            "starting workers"
        );

        let tasks = (0..worker_count)
            .map(|index| {
                let worker = Worker {
                    index,
                    target: Arc::clone(&target),
                    pool: Arc::clone(&self.pool),
                    limiter: Arc::clone(&self.limiter),
                    executor: Arc::clone(&self.executor),
                    settings: Arc::clone(&self.settings),
                    tracker: Arc::clone(&tracker),
                    state: WorkerState::Idle,
                };
                let span = info_span!("worker", campaign_id = %campaign_id, worker = index);
                tokio::spawn(worker.run().instrument(span))
            })
            .collect();

        CampaignHandle {
            id: campaign_id,
            target,
            tracker,
            worker_count,
            tasks,
            summaries: Vec::with_capacity(worker_count),
        }
    }
}

/// Control surface for a running campaign.
pub struct CampaignHandle {
    id: String,
    target: Arc<Target>,
    tracker: Arc<ProgressTracker>,
    worker_count: usize,
    tasks: Vec<JoinHandle<WorkerSummary>>,
    summaries: Vec<WorkerSummary>,
}

impl CampaignHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Cooperative: executions already running finish and are recorded.
    pub fn cancel(&self) {
        if !self.tracker.is_cancelled() {
            info!(campaign_id = %self.id, "campaign cancellation requested");
        }
        self.tracker.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.tracker.cancellation().clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tracker.snapshot()
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Summaries of the workers joined so far.
    pub fn summaries(&self) -> &[WorkerSummary] {
        &self.summaries
    }

    /// Wait for every worker to stop and build the final report.
    ///
    /// With a timeout, returns `Error::JoinTimeout` carrying a partial report
    /// if workers are still running; they are left running and `join` may be
    /// called again.
    pub async fn join(&mut self, timeout: Option<Duration>) -> Result<CampaignReport> {
        let drained = match timeout {
            Some(limit) => {
                tokio::time::timeout(limit, drain(&mut self.tasks, &mut self.summaries))
                    .await
                    .is_ok()
            }
            None => {
                drain(&mut self.tasks, &mut self.summaries).await;
                true
            }
        };

        if !drained {
            let mut partial = self.report(&self.tracker.snapshot());
            partial.partial = true;
            return Err(Error::JoinTimeout {
                timeout: timeout.unwrap_or_default(),
                partial: Box::new(partial),
            });
        }

        self.tracker.freeze();
        Ok(self.report(&self.tracker.snapshot()))
    }

    fn report(&self, snapshot: &ProgressSnapshot) -> CampaignReport {
        let outcome = if snapshot.completed >= snapshot.goal {
            CampaignOutcome::GoalReached
        } else if snapshot.cancelled {
            CampaignOutcome::Cancelled
        } else {
            CampaignOutcome::Exhausted
        };
        CampaignReport::from_snapshot(
            &self.id,
            &self.target.id,
            snapshot,
            self.worker_count,
            outcome,
        )
    }
}

async fn drain(tasks: &mut Vec<JoinHandle<WorkerSummary>>, summaries: &mut Vec<WorkerSummary>) {
    while let Some(task) = tasks.last_mut() {
        let joined = task.await;
        tasks.pop();
        match joined {
            Ok(summary) => summaries.push(summary),
            Err(e) => error!(error = %e, "worker task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutor, resource_records, target};
    use common::Backoff;
    use executor::{ErrorKind, Outcome};
    use resource_pool::{PoolOptions, StaticSource, Validity};
    use tokio::time::Instant;

    fn quiet_settings() -> WorkerSettings {
        WorkerSettings {
            retry: RetryPolicy {
                backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(50))
                    .without_jitter(),
                ..Default::default()
            },
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn loaded_pool(count: usize) -> Arc<ResourcePool> {
        let pool = Arc::new(ResourcePool::new(PoolOptions::default()));
        pool.load(&StaticSource::new(resource_records(count)))
            .await
            .unwrap();
        pool
    }

    fn workers(
        pool: &Arc<ResourcePool>,
        limiter: RateLimiter,
        executor: &Arc<FakeExecutor>,
    ) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(pool),
            Arc::new(limiter),
            Arc::clone(executor) as Arc<dyn ActionExecutor>,
            quiet_settings(),
        )
    }

    #[test]
    fn jitter_stays_in_range() {
        let settings = WorkerSettings::default();
        for _ in 0..200 {
            let pause = settings.jitter();
            assert!(pause >= Duration::from_millis(100) && pause <= Duration::from_millis(200));
        }
    }

    #[test]
    fn inverted_jitter_range_uses_minimum() {
        let settings = WorkerSettings {
            jitter_min: Duration::from_millis(50),
            jitter_max: Duration::from_millis(10),
            ..Default::default()
        };
        assert_eq!(settings.jitter(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn five_resources_reach_goal_of_five() {
        let pool = loaded_pool(5).await;
        let executor = Arc::new(FakeExecutor::succeeding());
        let workers = workers(&pool, RateLimiter::unlimited(), &executor);

        let mut handle = workers.start("cmp_test", target(), 5, 5).await;
        assert_eq!(handle.worker_count(), 5);
        let report = handle.join(None).await.unwrap();

        assert_eq!(report.completed, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(report.outcome, CampaignOutcome::GoalReached);
        assert_eq!(executor.calls(), 5);
        assert_eq!(executor.max_per_resource(), 1);

        let mut used = executor.executed();
        used.sort();
        assert_eq!(used, vec!["r1", "r2", "r3", "r4", "r5"]);
        for id in used {
            assert_eq!(pool.validity(&id).await, Some(Validity::Valid));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn goal_beyond_resources_ends_exhausted() {
        let pool = loaded_pool(10).await;
        let executor = Arc::new(FakeExecutor::succeeding().with_delay(Duration::from_millis(20)));
        let workers = workers(&pool, RateLimiter::unlimited(), &executor);

        let mut handle = workers.start("cmp_test", target(), 100, 4).await;
        let report = tokio::time::timeout(Duration::from_secs(60), handle.join(None))
            .await
            .expect("exhausted campaign must terminate")
            .unwrap();

        assert_eq!(report.completed, 10);
        assert_eq!(report.outcome, CampaignOutcome::Exhausted);
        assert!(
            handle
                .summaries()
                .iter()
                .all(|s| s.stop_reason == StopReason::Exhausted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn completed_never_exceeds_goal() {
        let pool = loaded_pool(10).await;
        let executor = Arc::new(FakeExecutor::succeeding().with_delay(Duration::from_millis(5)));
        let workers = workers(&pool, RateLimiter::unlimited(), &executor);

        let mut handle = workers.start("cmp_test", target(), 3, 10).await;
        assert_eq!(handle.worker_count(), 3);
        let report = handle.join(None).await.unwrap();

        assert_eq!(report.completed, 3);
        assert_eq!(executor.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_recorded_once_each() {
        let pool = loaded_pool(8).await;
        let executor = Arc::new(FakeExecutor::new(|id| match id {
            "r2" | "r5" => Outcome::Failure(ErrorKind::NotFound),
            _ => Outcome::Success,
        }));
        let workers = workers(&pool, RateLimiter::unlimited(), &executor);

        let mut handle = workers.start("cmp_test", target(), 6, 4).await;
        let report = handle.join(None).await.unwrap();

        assert_eq!(report.completed, 6);
        assert_eq!(report.failed, 2);
        assert_eq!(report.completed + report.failed, executor.calls());
        let executed: u64 = handle.summaries().iter().map(|s| s.executed).sum();
        assert_eq!(executed, executor.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_invalid_resource_is_retired() {
        let pool = loaded_pool(5).await;
        let executor = Arc::new(FakeExecutor::new(|id| {
            if id == "r2" {
                Outcome::Failure(ErrorKind::AuthInvalid)
            } else {
                Outcome::Success
            }
        }));
        let workers = workers(&pool, RateLimiter::unlimited(), &executor);

        let mut handle = workers.start("cmp_test", target(), 5, 2).await;
        let report = handle.join(None).await.unwrap();

        assert_eq!(report.completed, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcome, CampaignOutcome::Exhausted);
        assert_eq!(pool.validity("r2").await, Some(Validity::Invalid));
        assert_eq!(pool.available_count().await, 4);
        // Auth failures are terminal: one call, no retries
        assert_eq!(executor.executed().iter().filter(|id| *id == "r2").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_paces_execution() {
        let pool = loaded_pool(6).await;
        let executor = Arc::new(FakeExecutor::succeeding());
        let workers = workers(
            &pool,
            RateLimiter::new(2, Duration::from_secs(1)),
            &executor,
        );

        let start = Instant::now();
        let mut handle = workers.start("cmp_test", target(), 6, 6).await;
        let report = handle.join(None).await.unwrap();

        assert_eq!(report.completed, 6);
        // Calls 3-4 wait one period, calls 5-6 wait two
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn history_window_bounds_recent_rate() {
        async fn recent_rate(history_window: Duration) -> f64 {
            let pool = loaded_pool(4).await;
            let executor =
                Arc::new(FakeExecutor::succeeding().with_delay(Duration::from_secs(1)));
            let workers = WorkerPool::new(
                pool,
                Arc::new(RateLimiter::unlimited()),
                executor as Arc<dyn ActionExecutor>,
                WorkerSettings {
                    history_window,
                    ..quiet_settings()
                },
            );
            // One worker: completions land at 1s, 2s, 3s and 4s
            let mut handle = workers.start("cmp_test", target(), 4, 1).await;
            handle.join(None).await.unwrap();
            handle.snapshot().recent_rate_per_second
        }

        // Last 2s hold three completions
        assert!((recent_rate(Duration::from_secs(2)).await - 1.5).abs() < 0.05);
        // Default window spans the whole run
        assert!((recent_rate(DEFAULT_HISTORY_WINDOW).await - 1.0).abs() < 0.05);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_new_executions() {
        let pool = loaded_pool(20).await;
        let executor = Arc::new(FakeExecutor::succeeding().with_delay(Duration::from_millis(500)));
        let workers = workers(
            &pool,
            RateLimiter::new(2, Duration::from_secs(1)),
            &executor,
        );

        let mut handle = workers.start("cmp_test", target(), 20, 4).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        handle.cancel();
        let calls_at_cancel = executor.calls();

        let report = handle.join(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(executor.calls(), calls_at_cancel);
        assert_eq!(report.outcome, CampaignOutcome::Cancelled);
        assert!(report.completed < 20);
        assert!(
            handle
                .summaries()
                .iter()
                .all(|s| s.stop_reason == StopReason::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_lease_is_returned_unused() {
        let pool = loaded_pool(2).await;
        let executor = Arc::new(FakeExecutor::succeeding());
        let limiter = RateLimiter::new(1, Duration::from_secs(3600));
        // Burn the only slot so the worker parks in the limiter
        limiter.acquire_slot().await;
        let workers = workers(&pool, limiter, &executor);

        let mut handle = workers.start("cmp_test", target(), 2, 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        handle.join(Some(Duration::from_secs(1))).await.unwrap();

        assert_eq!(executor.calls(), 0);
        assert_eq!(pool.usage_count("r1").await, Some(0));
        // The target association was dropped with the lease
        assert!(pool.acquire(&target().id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn join_timeout_returns_partial_and_can_retry() {
        let pool = loaded_pool(3).await;
        let executor = Arc::new(FakeExecutor::succeeding().with_delay(Duration::from_secs(10)));
        let workers = workers(&pool, RateLimiter::unlimited(), &executor);

        let mut handle = workers.start("cmp_test", target(), 3, 3).await;
        let err = handle
            .join(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        match err {
            Error::JoinTimeout { partial, timeout } => {
                assert!(partial.partial);
                assert_eq!(partial.completed, 0);
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!handle.is_finished());

        let report = handle.join(None).await.unwrap();
        assert!(!report.partial);
        assert_eq!(report.completed, 3);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_panic_does_not_lose_counts() {
        let pool = loaded_pool(3).await;
        let executor = Arc::new(FakeExecutor::succeeding().panicking_on("r1"));
        let workers = workers(&pool, RateLimiter::unlimited(), &executor);

        let mut handle = workers.start("cmp_test", target(), 3, 3).await;
        let report = tokio::time::timeout(Duration::from_secs(10), handle.join(None))
            .await
            .expect("join must not hang after a panic")
            .unwrap();

        assert_eq!(report.completed, 2);
        assert_eq!(handle.snapshot().in_flight, 0);
        assert_eq!(handle.summaries().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_workers_without_resources_or_goal() {
        let pool = loaded_pool(2).await;
        let executor = Arc::new(FakeExecutor::succeeding());
        let workers = workers(&pool, RateLimiter::unlimited(), &executor);

        let mut handle = workers.start("cmp_test", target(), 0, 8).await;
        assert_eq!(handle.worker_count(), 0);
        assert!(handle.is_finished());
        let report = handle.join(None).await.unwrap();
        assert_eq!(report.outcome, CampaignOutcome::GoalReached);
        assert_eq!(executor.calls(), 0);
    }
}
