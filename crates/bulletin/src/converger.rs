// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer-driven convergence.
//!
//! A [`ConvergenceWorker`] calls one [`Converge`] engine on a fixed interval.
//! The tick body is awaited inline, so two runs of the same engine never
//! overlap; ticks that fall due while a run is still going are skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::Result;

/// Something that can be brought back to its desired state in one pass.
#[async_trait]
pub trait Converge: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Run one pass.
    async fn converge(&self) -> Result<()>;
}

/// Runs a [`Converge`] engine until told to stop.
pub struct ConvergenceWorker {
    engine: Arc<dyn Converge>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl ConvergenceWorker {
    /// Worker ticking every `interval`.
    pub fn new(engine: Arc<dyn Converge>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Tick until shutdown. The first pass runs one full interval after start.
    pub async fn run(self) {
        let name = self.engine.name();
        info!(
            engine = name,
            interval_secs = self.interval.as_secs_f64(),
            "Convergence worker started"
        );

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(engine = name, "Convergence worker shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    debug!(engine = name, "Convergence tick");
                    if let Err(e) = self.engine.converge().await {
                        error!(engine = name, error = %e, "Convergence pass failed");
                    }
                }
            }
        }
    }
}
