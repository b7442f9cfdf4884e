//! Quasar Poller: turns `@bot tip ...` mentions into custodial transfers.
//!
//! Flow:
//! 1. Connect to PostgreSQL and apply migrations
//! 2. Wire the pipeline (X client, BSC RPC, custody, optional Telegram fallback)
//! 3. Every poll interval: search mentions from the stored cursor, settle
//!    each batched tip, record it, reply
//! 4. Independently, every sweep interval: retry replies parked in the queue
//!
//! A failed cycle leaves the cursor where it was; the next tick retries.

use std::time::Duration;

use eyre::Result;
use quasar_core::{Settings, telemetry};
use quasar_pipeline::build_services;
use quasar_storage as storage;
use tokio::time::MissedTickBehavior;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Initialisation ──────────────────────────────────────────────────
    telemetry::init();
    let settings = Settings::from_env()?;

    tracing::info!(
        bot = %settings.bot_handle,
        query = %settings.search_query,
        rpc = %settings.rpc_url,
        "Starting Quasar Poller"
    );

    let pool = storage::connect(&settings.database_url).await?;
    tracing::info!("Connected to database");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let services = build_services(&settings, pool)?;
    let pipeline = services.pipeline;

    // ── Scheduling Loop ─────────────────────────────────────────────────
    let mut poll = tokio::time::interval(Duration::from_secs(settings.poll_interval_secs));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = tokio::time::interval(Duration::from_secs(settings.sweep_interval_secs));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down gracefully…");
                break;
            }
            _ = poll.tick() => {
                match pipeline.run_scheduled_poll().await {
                    Ok(report) => {
                        if let Some(until) = report.rate_limited_until {
                            tracing::warn!(%until, "Search rate limited");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Poll cycle failed, retrying next tick");
                    }
                }
            }
            _ = sweep.tick() => {
                if let Err(e) = pipeline.run_retry_sweep().await {
                    tracing::error!(error = %e, "Retry sweep failed");
                }
            }
        }
    }

    tracing::info!("Poller stopped.");
    Ok(())
}
