//! Final campaign summary and the sink it is delivered to

use std::time::Duration;

use serde::{Serialize, Serializer};
use tracing::info;

use crate::tracker::ProgressSnapshot;

pub(crate) fn as_secs_f64<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

pub(crate) fn as_opt_secs_f64<S: Serializer>(
    d: &Option<Duration>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// How a campaign ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignOutcome {
    GoalReached,
    /// Every usable resource already acted on the target
    Exhausted,
    Cancelled,
    DeadlineExceeded,
}

impl CampaignOutcome {
    pub fn label(self) -> &'static str {
        match self {
            CampaignOutcome::GoalReached => "goal_reached",
            CampaignOutcome::Exhausted => "exhausted",
            CampaignOutcome::Cancelled => "cancelled",
            CampaignOutcome::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub campaign_id: String,
    pub target: String,
    pub goal: u64,
    pub completed: u64,
    pub failed: u64,
    #[serde(rename = "elapsed_secs", serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    /// `completed / (completed + failed)`, zero when nothing ran
    pub success_rate: f64,
    pub rate_per_second: f64,
    pub workers: usize,
    pub outcome: CampaignOutcome,
    /// Set when some workers were still running at drain timeout
    pub partial: bool,
}

impl CampaignReport {
    /// Report for a campaign that had nothing to do.
    pub(crate) fn empty(campaign_id: &str, target: &str) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            target: target.to_string(),
            goal: 0,
            completed: 0,
            failed: 0,
            elapsed: Duration::ZERO,
            success_rate: 0.0,
            rate_per_second: 0.0,
            workers: 0,
            outcome: CampaignOutcome::GoalReached,
            partial: false,
        }
    }

    pub(crate) fn from_snapshot(
        campaign_id: &str,
        target: &str,
        snapshot: &ProgressSnapshot,
        workers: usize,
        outcome: CampaignOutcome,
    ) -> Self {
        let attempted = snapshot.completed + snapshot.failed;
        let success_rate = if attempted > 0 {
            snapshot.completed as f64 / attempted as f64
        } else {
            0.0
        };
        Self {
            campaign_id: campaign_id.to_string(),
            target: target.to_string(),
            goal: snapshot.goal,
            completed: snapshot.completed,
            failed: snapshot.failed,
            elapsed: snapshot.elapsed,
            success_rate,
            rate_per_second: snapshot.rate_per_second,
            workers,
            outcome,
            partial: false,
        }
    }
}

/// Receives periodic progress and the final report.
pub trait Reporter: Send + Sync {
    fn progress(&self, campaign_id: &str, snapshot: &ProgressSnapshot);
    fn finished(&self, report: &CampaignReport);
}

/// Emits progress and reports as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn progress(&self, campaign_id: &str, snapshot: &ProgressSnapshot) {
        info!(
            campaign_id,
            completed = snapshot.completed,
            failed = snapshot.failed,
            in_flight = snapshot.in_flight,
            goal = snapshot.goal,
            rate_per_second = snapshot.rate_per_second,
            recent_rate_per_second = snapshot.recent_rate_per_second,
            eta_secs = snapshot.eta.map(|d| d.as_secs()),
            "campaign progress"
        );
    }

    fn finished(&self, report: &CampaignReport) {
        info!(
            campaign_id = %report.campaign_id,
            target = %report.target,
            completed = report.completed,
            failed = report.failed,
            goal = report.goal,
            elapsed_secs = report.elapsed.as_secs_f64(),
            success_rate = report.success_rate,
            outcome = report.outcome.label(),
            partial = report.partial,
            "campaign finished"
        );
    }
}
