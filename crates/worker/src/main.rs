//! Rebill background worker
//!
//! Runs the scheduled jobs that keep billing state moving: the daily renewal
//! sweep, expiry warnings and lapse handling, pending downgrades, the webhook
//! retry sweep, and event retention cleanup. All jobs are safe to run
//! alongside another worker instance; claims are conditional updates, so
//! overlapping runs skip instead of double-charging.

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rebill_api::{AppState, Config};
use rebill_shared::db;

/// Completed webhook events are kept this long for audit before deletion
const WEBHOOK_RETENTION_DAYS: i64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rebill_worker=info,rebill_billing=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let state = AppState::new(pool, config);
    let scheduler = JobScheduler::new()
        .await
        .context("Failed to create job scheduler")?;

    // Daily renewal sweep at 02:00 UTC
    {
        let state = state.clone();
        scheduler
            .add(Job::new_async("0 0 2 * * *", move |_id, _lock| {
                let state = state.clone();
                Box::pin(async move {
                    info!("Starting renewal sweep");
                    match state.scheduler.run_renewals().await {
                        Ok(run) => info!(
                            attempted = run.attempted,
                            renewed = run.renewed,
                            failed = run.failed,
                            skipped = run.skipped,
                            pending = run.pending,
                            "Renewal sweep complete"
                        ),
                        Err(e) => error!(error = %e, "Renewal sweep failed"),
                    }
                })
            })?)
            .await?;
    }

    // Expiry warnings at 09:00 UTC, when subscribers are likely awake
    {
        let state = state.clone();
        scheduler
            .add(Job::new_async("0 0 9 * * *", move |_id, _lock| {
                let state = state.clone();
                Box::pin(async move {
                    match state.scheduler.run_expiry_warnings().await {
                        Ok(warned) => {
                            if warned > 0 {
                                info!(warned = warned, "Sent expiry warnings");
                            }
                        }
                        Err(e) => error!(error = %e, "Expiry warning sweep failed"),
                    }
                })
            })?)
            .await?;
    }

    // Expire lapsed subscriptions hourly
    {
        let state = state.clone();
        scheduler
            .add(Job::new_async("0 15 * * * *", move |_id, _lock| {
                let state = state.clone();
                Box::pin(async move {
                    match state.scheduler.run_expiry_sweep().await {
                        Ok(expired) => {
                            if expired > 0 {
                                info!(expired = expired, "Expired lapsed subscriptions");
                            }
                        }
                        Err(e) => error!(error = %e, "Expiry sweep failed"),
                    }
                })
            })?)
            .await?;
    }

    // Apply pending downgrades hourly, after the expiry sweep
    {
        let state = state.clone();
        scheduler
            .add(Job::new_async("0 20 * * * *", move |_id, _lock| {
                let state = state.clone();
                Box::pin(async move {
                    match state.scheduler.run_downgrade_sweep().await {
                        Ok(applied) => {
                            if applied > 0 {
                                info!(applied = applied, "Applied scheduled downgrades");
                            }
                        }
                        Err(e) => error!(error = %e, "Downgrade sweep failed"),
                    }
                })
            })?)
            .await?;
    }

    // Webhook retry sweep every 5 minutes
    {
        let state = state.clone();
        scheduler
            .add(Job::new_async("0 */5 * * * *", move |_id, _lock| {
                let state = state.clone();
                Box::pin(async move {
                    match state.webhooks.process_due_batch().await {
                        // Claimed-but-retrying events are not counted here;
                        // they log their own warnings inside the sweep.
                        Ok(completed) => {
                            if completed > 0 {
                                info!(completed = completed, "Webhook sweep completed events");
                            }
                        }
                        Err(e) => error!(error = %e, "Webhook sweep failed"),
                    }
                })
            })?)
            .await?;
    }

    // Webhook retention cleanup daily at 04:00 UTC
    {
        let state = state.clone();
        scheduler
            .add(Job::new_async("0 0 4 * * *", move |_id, _lock| {
                let state = state.clone();
                Box::pin(async move {
                    if let Err(e) = state
                        .webhooks
                        .cleanup_old_events(WEBHOOK_RETENTION_DAYS)
                        .await
                    {
                        error!(error = %e, "Webhook cleanup failed");
                    }
                })
            })?)
            .await?;
    }

    scheduler.start().await.context("Failed to start scheduler")?;
    info!("Worker started, jobs scheduled");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down worker");

    Ok(())
}
