#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Kora Background Worker
//!
//! Handles scheduled jobs including:
//! - Grace period sweep: suspend users whose grace window elapsed (daily at 2:10 AM UTC)
//! - Claims outbox + notification retry processing (every minute)
//! - Daily usage counter reset (daily at 0:15 UTC)
//! - Outbox and notification queue cleanup (daily at 3:00 AM UTC)

use std::time::Duration;

use kora_billing::BillingService;
use kora_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Kora Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => b,
        Err(e) => {
            // If Stripe isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without Stripe integration");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Grace period sweep (daily at 2:10 AM UTC)
    // Suspends users whose grace window has elapsed; re-runs are no-ops.
    let sweeper = billing.sweeper.clone();
    scheduler
        .add(Job::new_async("0 10 2 * * *", move |_uuid, _l| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                info!("Running grace period sweep");
                if let Err(e) = sweeper.sweep().await {
                    error!(error = %e, "Grace period sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Grace period sweep (daily at 2:10 AM UTC)");

    // Job 2: Process the claims outbox and the notification queue (every minute)
    // Retries deliveries the inline fast path missed, so a crash between the
    // status commit and delivery is recovered here.
    let sync = billing.sync.clone();
    let notify = billing.notify.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let sync = sync.clone();
            let notify = notify.clone();
            Box::pin(async move {
                match sync.process_claims_outbox().await {
                    Ok(summary) if summary.processed > 0 => {
                        info!(
                            processed = summary.processed,
                            delivered = summary.delivered,
                            retried = summary.retried,
                            exhausted = summary.exhausted,
                            "Claims outbox pass complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Claims outbox processing failed"),
                }

                match notify.process_pending().await {
                    Ok(summary) if summary.processed > 0 => {
                        info!(
                            processed = summary.processed,
                            sent = summary.sent,
                            retried = summary.retried,
                            exhausted = summary.exhausted,
                            "Notification queue pass complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Notification queue processing failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Outbox and notification processing (every minute)");

    // Job 3: Reset expired usage counters (daily at 0:15 UTC)
    let usage = billing.usage.clone();
    scheduler
        .add(Job::new_async("0 15 0 * * *", move |_uuid, _l| {
            let usage = usage.clone();
            Box::pin(async move {
                info!("Running usage counter reset");
                match usage.reset_expired().await {
                    Ok(reset) => info!(reset = reset, "Usage counter reset complete"),
                    Err(e) => error!(error = %e, "Usage counter reset failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Usage counter reset (daily at 0:15 UTC)");

    // Job 4: Clean up terminal outbox and notification rows (daily at 3:00 AM UTC)
    // Ledger rows are audit records and are intentionally never cleaned.
    let cleanup_sync = billing.sync.clone();
    let cleanup_notify = billing.notify.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let sync = cleanup_sync.clone();
            let notify = cleanup_notify.clone();
            Box::pin(async move {
                info!("Running queue cleanup");
                match sync.cleanup_outbox(7).await {
                    Ok(deleted) => info!(deleted = deleted, "Claims outbox cleanup complete"),
                    Err(e) => error!(error = %e, "Claims outbox cleanup failed"),
                }
                match notify.cleanup(7).await {
                    Ok(deleted) => info!(deleted = deleted, "Notification cleanup complete"),
                    Err(e) => error!(error = %e, "Notification cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Queue cleanup (daily at 3:00 AM UTC, keep 7 days)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Kora Worker started successfully with {} scheduled jobs", 5);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
