//! Campaign runner
//!
//! Single-binary service that:
//! 1. Loads configuration and the resource file
//! 2. Resolves the target through the configured endpoint
//! 3. Runs one rate-limited campaign to its goal
//! 4. Serves progress and metrics while it runs
//! 5. Logs the final report as JSON

mod config;
mod metrics;
mod monitor;

use anyhow::{Context, Result};
use dispatch::{CampaignController, CampaignOutcome, TracingReporter};
use executor::{HttpExecutor, HttpResolver};
use reqwest::Url;
use resource_pool::FileSource;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{CliArgs, Config};
use crate::monitor::{MonitorState, build_router};

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting campaign-runner");
    let started_at = Instant::now();

    // Install before any metric is emitted
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli = CliArgs::parse(&args).context("invalid command line")?;

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path, &cli)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        target_ref = %config.campaign.target,
        goal = config.campaign.goal,
        concurrency = config.campaign.concurrency,
        endpoint = %config.executor.endpoint,
        resources = %config.resources.path.display(),
        max_calls = ?config.rate_limit.max_calls,
        period_secs = config.rate_limit.period_secs,
        "configuration loaded"
    );
    if config.penalty_settings_ignored() {
        warn!("rate_limit penalty settings have no effect without rate_limit.max_calls");
    }

    let endpoint = Url::parse(&config.executor.endpoint)
        .with_context(|| format!("invalid executor endpoint {}", config.executor.endpoint))?;
    let client = reqwest::Client::new();

    let mut resolver = HttpResolver::new(client.clone(), endpoint.clone());
    if let Some(key) = config.executor.api_key.clone() {
        resolver = resolver.with_api_key(key);
    }

    let controller = Arc::new(CampaignController::new(
        Arc::new(resolver),
        Arc::new(FileSource::new(config.resources.path.clone())),
        Arc::new(HttpExecutor::new(client, endpoint)),
        Arc::new(config.rate_limiter()),
        Arc::new(TracingReporter),
        config.campaign_settings(),
    ));

    if let Some(addr) = config.monitor.listen_addr {
        let app = build_router(
            MonitorState {
                controller: Arc::clone(&controller),
                prometheus: prometheus_handle,
                started_at,
            },
            config.monitor.max_connections,
        );
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind monitor to {addr}"))?;
        info!(%addr, "monitor listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "monitor server failed");
            }
        });
    }

    // SIGINT/SIGTERM cancel the campaign; in-flight work drains
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let report = controller
        .run_with_cancel(
            &config.campaign.target,
            config.campaign.goal,
            config.campaign.concurrency,
            cancel,
        )
        .await
        .context("campaign failed")?;

    let rendered = serde_json::to_string(&report).context("failed to render report")?;
    match report.outcome {
        CampaignOutcome::GoalReached => info!(report = %rendered, "campaign report"),
        _ => warn!(report = %rendered, "campaign ended before reaching goal"),
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, cancelling campaign"),
        _ = terminate => info!("received SIGTERM, cancelling campaign"),
    }
}
