//! Campaign orchestration
//!
//! `run` resolves the target, loads a fresh resource pool, starts workers and
//! waits for one of: every worker stopped, caller cancellation, or the
//! campaign deadline. Cancellation and deadline both drain workers with a
//! bounded wait; a drain that times out produces a partial report.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use executor::{ActionExecutor, TargetResolver};
use resource_pool::{PoolOptions, ResourcePool, ResourceSource};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::report::{CampaignOutcome, CampaignReport, Reporter};
use crate::tracker::ProgressTracker;
use crate::worker::{WorkerPool, WorkerSettings};

#[derive(Debug, Clone)]
pub struct CampaignSettings {
    pub pool: PoolOptions,
    pub workers: WorkerSettings,
    /// Cancel the campaign once this much time has passed
    pub deadline: Option<Duration>,
    /// How long to wait for in-flight work after cancellation
    pub drain_timeout: Duration,
    pub progress_interval: Duration,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            pool: PoolOptions::default(),
            workers: WorkerSettings::default(),
            deadline: None,
            drain_timeout: Duration::from_secs(5),
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// Live view of the running (or last finished) campaign.
#[derive(Clone)]
pub struct LiveCampaign {
    pub campaign_id: String,
    pub tracker: Arc<ProgressTracker>,
    pub pool: Arc<ResourcePool>,
}

enum Wake {
    Finished(Result<CampaignReport>),
    Cancelled,
    Deadline,
}

pub struct CampaignController {
    resolver: Arc<dyn TargetResolver>,
    source: Arc<dyn ResourceSource>,
    executor: Arc<dyn ActionExecutor>,
    limiter: Arc<RateLimiter>,
    reporter: Arc<dyn Reporter>,
    settings: CampaignSettings,
    current: Mutex<Option<LiveCampaign>>,
}

impl CampaignController {
    pub fn new(
        resolver: Arc<dyn TargetResolver>,
        source: Arc<dyn ResourceSource>,
        executor: Arc<dyn ActionExecutor>,
        limiter: Arc<RateLimiter>,
        reporter: Arc<dyn Reporter>,
        settings: CampaignSettings,
    ) -> Self {
        Self {
            resolver,
            source,
            executor,
            limiter,
            reporter,
            settings,
            current: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<LiveCampaign> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_current(&self, live: LiveCampaign) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(live);
    }

    pub async fn run(
        &self,
        target_ref: &str,
        goal: u64,
        concurrency_hint: usize,
    ) -> Result<CampaignReport> {
        self.run_with_cancel(target_ref, goal, concurrency_hint, CancellationToken::new())
            .await
    }

    /// Like `run`, stopping cooperatively when `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        target_ref: &str,
        goal: u64,
        concurrency_hint: usize,
        cancel: CancellationToken,
    ) -> Result<CampaignReport> {
        let campaign_id = format!("cmp_{}", Uuid::new_v4().simple());
        let span = info_span!("campaign", campaign_id = %campaign_id);
        self.drive(campaign_id, target_ref, goal, concurrency_hint, cancel)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        campaign_id: String,
        target_ref: &str,
        goal: u64,
        concurrency_hint: usize,
        cancel: CancellationToken,
    ) -> Result<CampaignReport> {
        let target = self.resolver.resolve(target_ref).await.inspect_err(|e| {
            warn!(target_ref, error = %e, "target resolution failed");
        })?;
        info!(target_ref, target_id = %target.id, goal, "target resolved");

        if goal == 0 {
            let report = CampaignReport::empty(&campaign_id, &target.id);
            self.reporter.finished(&report);
            return Ok(report);
        }

        let pool = Arc::new(ResourcePool::new(self.settings.pool));
        pool.load(self.source.as_ref()).await?;

        let workers = WorkerPool::new(
            Arc::clone(&pool),
            Arc::clone(&self.limiter),
            Arc::clone(&self.executor),
            self.settings.workers.clone(),
        );
        let mut handle = workers
            .start(campaign_id.clone(), target, goal, concurrency_hint.max(1))
            .await;
        self.set_current(LiveCampaign {
            campaign_id: campaign_id.clone(),
            tracker: handle.tracker(),
            pool,
        });

        let deadline = self.settings.deadline;
        let deadline_timer = async move {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_timer);

        let mut ticker = tokio::time::interval(
            self.settings
                .progress_interval
                .max(Duration::from_millis(1)),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let wake = loop {
            tokio::select! {
                joined = handle.join(None) => break Wake::Finished(joined),
                _ = cancel.cancelled() => break Wake::Cancelled,
                _ = &mut deadline_timer => break Wake::Deadline,
                _ = ticker.tick() => {
                    self.reporter.progress(&campaign_id, &handle.snapshot());
                }
            }
        };

        let (joined, hit_deadline) = match wake {
            Wake::Finished(joined) => (Some(joined), false),
            Wake::Cancelled => (None, false),
            Wake::Deadline => (None, true),
        };
        let mut report = match joined {
            Some(joined) => joined?,
            None => {
                if hit_deadline {
                    warn!(
                        deadline_secs = deadline.map(|d| d.as_secs()),
                        "campaign deadline reached"
                    );
                }
                handle.cancel();
                match handle.join(Some(self.settings.drain_timeout)).await {
                    Ok(report) => report,
                    Err(Error::JoinTimeout { partial, timeout }) => {
                        warn!(
                            drain_timeout_ms = timeout.as_millis() as u64,
                            "workers did not drain in time, reporting partial results"
                        );
                        *partial
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        if hit_deadline && report.outcome != CampaignOutcome::GoalReached {
            report.outcome = CampaignOutcome::DeadlineExceeded;
        }

        self.reporter.finished(&report);
        Ok(report)
    }
}
