//! Membra Background Worker
//!
//! Runs the polling reconciler and scheduled housekeeping:
//! - Heartbeat (every 5 minutes)
//! - Invariant checks (hourly)
//! - Webhook log purge (daily at 3:00 AM UTC)

mod jobs;

use std::sync::Arc;

use membra_billing::BillingService;
use membra_shared::{create_pool, init_tracing, run_migrations, DbConfig, LogFormat};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing(
        "info,membra_worker=debug,membra_billing=debug",
        LogFormat::from_env(),
    );

    info!("Starting Membra Worker v{}", env!("CARGO_PKG_VERSION"));

    let db_config =
        DbConfig::from_env().ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&db_config).await?;
    if db_config.run_migrations {
        run_migrations(&pool).await?;
    }

    let billing = Arc::new(BillingService::from_env(pool)?);

    billing.reconciler.start();

    let scheduler = JobScheduler::new().await?;

    // Job 1: Heartbeat
    // Cron: Every 5 minutes
    let heartbeat_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = heartbeat_billing.clone();
            Box::pin(async move {
                jobs::heartbeat(&billing);
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    // Job 2: Invariant checks
    // Cron: At minute 0 of every hour
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running scheduled invariant checks");
                jobs::run_invariant_checks(billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (hourly)");

    // Job 3: Webhook log purge
    // Cron: At 3:00 AM UTC daily
    let retention = jobs::webhook_log_retention();
    let purge_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = purge_billing.clone();
            Box::pin(async move {
                info!("Running scheduled webhook log purge");
                jobs::purge_webhook_log(billing, retention).await;
            })
        })?)
        .await?;
    info!(
        retention_days = retention.whole_days(),
        "Scheduled: Webhook log purge (daily at 3:00 AM UTC)"
    );

    scheduler.start().await?;
    info!("Worker started, waiting for jobs...");

    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    billing.reconciler.stop();
    let mut scheduler = scheduler;
    scheduler.shutdown().await?;
    info!("Worker stopped");
    Ok(())
}
