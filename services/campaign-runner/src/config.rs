//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The executor API key is loaded from CAMPAIGN_API_KEY or api_key_file,
//! never stored in the TOML directly.

use common::{Backoff, Secret};
use dispatch::{CampaignSettings, RateLimiter, RetryPolicy, WorkerSettings};
use resource_pool::PoolOptions;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub campaign: CampaignConfig,
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub jitter: JitterConfig,
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize)]
pub struct CampaignConfig {
    /// Reference handed to the target resolver
    pub target: String,
    pub goal: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,
    /// Trailing window for the recent completion rate
    #[serde(default = "default_history_window")]
    pub history_window_secs: u64,
}

/// Credential file settings
#[derive(Debug, Deserialize)]
pub struct ResourcesConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub allow_shared: bool,
}

/// Sliding-window limit. Without `max_calls` the campaign is unlimited.
#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub max_calls: Option<u32>,
    #[serde(default = "default_period")]
    pub period_secs: u64,
    /// Shrinks `max_calls` on rate-limited responses. Has no effect while
    /// `max_calls` is unset.
    #[serde(default = "default_penalty_factor")]
    pub penalty_factor: f64,
    #[serde(default = "default_penalty_cooldown")]
    pub penalty_cooldown_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: None,
            period_secs: default_period(),
            penalty_factor: default_penalty_factor(),
            penalty_cooldown_secs: default_penalty_cooldown(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            attempt_timeout_secs: default_attempt_timeout(),
        }
    }
}

/// Pause between work items on one worker
#[derive(Debug, Deserialize)]
pub struct JitterConfig {
    #[serde(default = "default_jitter_min")]
    pub min_ms: u64,
    #[serde(default = "default_jitter_max")]
    pub max_ms: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_ms: default_jitter_min(),
            max_ms: default_jitter_max(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecutorConfig {
    /// Base URL of the action endpoint
    pub endpoint: String,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the API key (alternative to CAMPAIGN_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

/// Monitor HTTP endpoints; disabled without `listen_addr`
#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_concurrency() -> usize {
    8
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_progress_interval() -> u64 {
    10
}

fn default_history_window() -> u64 {
    60
}

fn default_period() -> u64 {
    1
}

fn default_penalty_factor() -> f64 {
    0.5
}

fn default_penalty_cooldown() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    250
}

fn default_max_delay() -> u64 {
    5000
}

fn default_attempt_timeout() -> u64 {
    30
}

fn default_jitter_min() -> u64 {
    100
}

fn default_jitter_max() -> u64 {
    200
}

fn default_max_connections() -> usize {
    64
}

/// Flags accepted on the command line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub config: Option<String>,
    pub target: Option<String>,
    pub goal: Option<u64>,
}

impl CliArgs {
    /// Parse `--config`, `--target` and `--goal`; unknown arguments are ignored.
    pub fn parse(args: &[String]) -> common::Result<Self> {
        let value_of = |flag: &str| -> common::Result<Option<String>> {
            match args.iter().position(|a| a == flag) {
                Some(i) => args
                    .get(i + 1)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| common::Error::config(format!("{flag} requires a value"))),
                None => Ok(None),
            }
        };

        let goal = value_of("--goal")?
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| {
                    common::Error::config(format!("--goal must be a whole number, got: {raw}"))
                })
            })
            .transpose()?;

        Ok(Self {
            config: value_of("--config")?,
            target: value_of("--target")?,
            goal,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables and
    /// CLI flags, then validate.
    ///
    /// API key resolution order:
    /// 1. CAMPAIGN_API_KEY env var
    /// 2. api_key_file path from config
    pub fn load(path: &Path, cli: &CliArgs) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Some(target) = &cli.target {
            config.campaign.target = target.clone();
        }
        if let Some(goal) = cli.goal {
            config.campaign.goal = goal;
        }

        if let Ok(key) = std::env::var("CAMPAIGN_API_KEY") {
            config.executor.api_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.executor.api_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.executor.api_key = Some(Secret::new(key));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.campaign.target.trim().is_empty() {
            return Err(common::Error::config("campaign.target must not be empty"));
        }
        if self.campaign.goal == 0 {
            return Err(common::Error::config("campaign.goal must be greater than 0"));
        }
        if self.campaign.concurrency == 0 {
            return Err(common::Error::config(
                "campaign.concurrency must be greater than 0",
            ));
        }
        if self.campaign.deadline_secs == Some(0) {
            return Err(common::Error::config(
                "campaign.deadline_secs must be greater than 0",
            ));
        }
        if self.campaign.progress_interval_secs == 0 {
            return Err(common::Error::config(
                "campaign.progress_interval_secs must be greater than 0",
            ));
        }
        if self.campaign.history_window_secs == 0 {
            return Err(common::Error::config(
                "campaign.history_window_secs must be greater than 0",
            ));
        }

        if !self.executor.endpoint.starts_with("http://")
            && !self.executor.endpoint.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "executor.endpoint must start with http:// or https://, got: {}",
                self.executor.endpoint
            )));
        }

        if self.rate_limit.max_calls == Some(0) {
            return Err(common::Error::config(
                "rate_limit.max_calls must be greater than 0",
            ));
        }
        if self.rate_limit.period_secs == 0 {
            return Err(common::Error::config(
                "rate_limit.period_secs must be greater than 0",
            ));
        }
        let factor = self.rate_limit.penalty_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(common::Error::Config(format!(
                "rate_limit.penalty_factor must be in (0, 1], got: {factor}"
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(common::Error::config(
                "retry.max_attempts must be greater than 0",
            ));
        }
        if self.retry.attempt_timeout_secs == 0 {
            return Err(common::Error::config(
                "retry.attempt_timeout_secs must be greater than 0",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(common::Error::config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }

        if self.jitter.min_ms > self.jitter.max_ms {
            return Err(common::Error::Config(format!(
                "jitter.min_ms ({}) must not exceed jitter.max_ms ({})",
                self.jitter.min_ms, self.jitter.max_ms
            )));
        }

        if self.monitor.max_connections == 0 {
            return Err(common::Error::config(
                "monitor.max_connections must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("campaign-runner.toml")
    }

    /// True when penalty settings differ from their defaults but no
    /// `max_calls` is set, so the limiter is unlimited and ignores them.
    pub fn penalty_settings_ignored(&self) -> bool {
        let rl = &self.rate_limit;
        rl.max_calls.is_none()
            && (rl.penalty_factor != default_penalty_factor()
                || rl.penalty_cooldown_secs != default_penalty_cooldown())
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        match self.rate_limit.max_calls {
            Some(max) => RateLimiter::new(max, Duration::from_secs(self.rate_limit.period_secs))
                .with_penalty_cooldown(Duration::from_secs(self.rate_limit.penalty_cooldown_secs)),
            None => RateLimiter::unlimited(),
        }
    }

    pub fn campaign_settings(&self) -> CampaignSettings {
        CampaignSettings {
            pool: PoolOptions {
                allow_shared: self.resources.allow_shared,
                ..Default::default()
            },
            workers: WorkerSettings {
                retry: RetryPolicy {
                    max_attempts: self.retry.max_attempts,
                    backoff: Backoff::new(
                        Duration::from_millis(self.retry.base_delay_ms),
                        Duration::from_millis(self.retry.max_delay_ms),
                    ),
                    attempt_timeout: Duration::from_secs(self.retry.attempt_timeout_secs),
                    penalty_factor: self.rate_limit.penalty_factor,
                },
                jitter_min: Duration::from_millis(self.jitter.min_ms),
                jitter_max: Duration::from_millis(self.jitter.max_ms),
                history_window: Duration::from_secs(self.campaign.history_window_secs),
            },
            deadline: self.campaign.deadline_secs.map(Duration::from_secs),
            drain_timeout: Duration::from_secs(self.campaign.drain_timeout_secs),
            progress_interval: Duration::from_secs(self.campaign.progress_interval_secs),
        }
    }
}
