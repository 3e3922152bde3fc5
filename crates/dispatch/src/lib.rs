//! Rate-limited campaign dispatch
//!
//! Drives a pool of workers that rotate credentials from a `ResourcePool`
//! against one target until a goal count is reached, the caller cancels, or
//! every usable resource has acted on the target.
//!
//! - `limiter`: sliding-window rate limiter with adaptive penalties
//! - `retry`: bounded retry around one executor call
//! - `tracker`: goal accounting and progress snapshots
//! - `worker`: worker loop and `CampaignHandle`
//! - `controller`: resolve, load, run, report

pub mod controller;
pub mod error;
pub mod limiter;
pub mod report;
pub mod retry;
pub mod telemetry;
pub mod tracker;
pub mod worker;

#[cfg(test)]
mod testing;

pub use controller::{CampaignController, CampaignSettings, LiveCampaign};
pub use error::{Error, Result};
pub use limiter::RateLimiter;
pub use report::{CampaignOutcome, CampaignReport, Reporter, TracingReporter};
pub use retry::{Attempted, RetryPolicy};
pub use tracker::{ProgressSnapshot, ProgressTracker, StopReason, WorkResult};
pub use worker::{CampaignHandle, WorkerPool, WorkerSettings, WorkerState, WorkerSummary};
