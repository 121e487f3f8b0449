#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Meterline Background Worker
//!
//! Handles scheduled jobs including:
//! - Usage reconciliation to Stripe (every 15 minutes by default)
//! - Heartbeat logging (every 5 minutes)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use meterline_billing::BillingService;
use meterline_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::jobs::{ReconcileJob, DEFAULT_RECONCILE_SCHEDULE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json_logs(std::env::var("LOG_FORMAT").ok().as_deref())? {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting Meterline Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let billing = Arc::new(BillingService::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Push processor-billed balances to Stripe
    let schedule = std::env::var("RECONCILE_SCHEDULE")
        .unwrap_or_else(|_| DEFAULT_RECONCILE_SCHEDULE.to_string());
    let reconcile = ReconcileJob::new(billing);
    scheduler
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let job = reconcile.clone();
            Box::pin(async move {
                job.run().await;
            })
        })?)
        .await?;
    info!(schedule = %schedule, "Scheduled: Usage reconciliation");

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Meterline Worker started successfully with 2 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

/// `LOG_FORMAT`, same values the API server accepts
fn json_logs(log_format: Option<&str>) -> anyhow::Result<bool> {
    match log_format.map(str::to_ascii_lowercase).as_deref() {
        None | Some("pretty") | Some("text") => Ok(false),
        Some("json") => Ok(true),
        Some(other) => Err(anyhow::anyhow!("LOG_FORMAT is invalid: {}", other)),
    }
}
