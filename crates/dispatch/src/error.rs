use std::time::Duration;

use thiserror::Error;

use crate::report::CampaignReport;

#[derive(Error, Debug)]
pub enum Error {
    #[error("target resolution failed: {0}")]
    TargetResolution(#[from] executor::ResolutionError),

    #[error("resource load failed: {0}")]
    ResourceLoad(#[from] resource_pool::Error),

    /// Workers were still running when the join timeout elapsed. They keep
    /// running detached; `partial` holds the counts at that moment.
    #[error("workers still running after {}ms", .timeout.as_millis())]
    JoinTimeout {
        timeout: Duration,
        partial: Box<CampaignReport>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
