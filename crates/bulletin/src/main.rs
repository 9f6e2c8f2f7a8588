// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulletin - LRP and Task State Server
//!
//! Holds the bulletin lock, then runs:
//! - LRP convergence (missing, extra, crashed and orphaned instances)
//! - Task convergence (kicks, expiries, lost cells)
//! - Task completion callbacks

use std::sync::Arc;
use tracing::{error, info, warn};

use bulletin::clock::{Clock, SystemClock};
use bulletin::config::Config;
use bulletin::metrics;
use bulletin::models::BbsPresence;
use bulletin::paths;
use bulletin::runtime::BulletinRuntime;
use bulletin::services::PresenceHeartbeat;
use bulletin::store::{KvBackend, MemoryBackend, PostgresBackend, StoreGateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bulletin=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        bbs_id = %config.bbs_id,
        advertise_url = %config.advertise_url,
        converge_interval_secs = config.converge_interval.as_secs(),
        "Starting Bulletin"
    );

    metrics::register_metrics();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let backend: Arc<dyn KvBackend> = match &config.database_url {
        Some(database_url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await?;
            info!("Connected to database");

            bulletin::migrations::run(&pool).await?;
            info!("Database schema verified");

            Arc::new(PostgresBackend::new(pool, clock.clone()))
        }
        None => {
            warn!("BULLETIN_DATABASE_URL not set, state is kept in memory only");
            Arc::new(MemoryBackend::new(clock.clone()))
        }
    };

    // Only one bulletin converges at a time
    let presence = BbsPresence {
        bbs_id: config.bbs_id.clone(),
        url: config.advertise_url.clone(),
    };
    let lock = Arc::new(PresenceHeartbeat::lock(
        StoreGateway::new(backend.clone()),
        paths::BBS_LOCK,
        &presence,
        config.lock_ttl,
    )?);
    let lock_shutdown = lock.shutdown_handle();

    let index = tokio::select! {
        acquired = lock.acquire() => acquired?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received before acquiring the lock");
            return Ok(());
        }
    };

    let heartbeat = lock.clone();
    let mut lock_handle = tokio::spawn(async move { heartbeat.run(index).await });

    let runtime = BulletinRuntime::builder()
        .config(&config)
        .backend(backend)
        .clock(clock)
        .build()?
        .start()
        .await?;

    info!("Bulletin ready");

    let lost = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            false
        }
        result = &mut lock_handle => {
            match result {
                Ok(Ok(())) => warn!("Lock heartbeat stopped"),
                Ok(Err(e)) => error!(error = %e, "Lost the bulletin lock"),
                Err(e) => error!("Lock heartbeat task panicked: {}", e),
            }
            true
        }
    };

    // Graceful shutdown
    runtime.shutdown().await?;

    if lost {
        anyhow::bail!("bulletin lock lost");
    }

    lock_shutdown.notify_one();
    if let Err(e) = lock_handle.await {
        error!("Lock heartbeat task panicked: {}", e);
    }

    info!("Bulletin shut down");

    Ok(())
}
