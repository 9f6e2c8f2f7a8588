// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable bulletin runtime.
//!
//! Provides a way to run the bulletin board's background work inside an
//! existing application, without the `bulletin` binary.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bulletin::clock::SystemClock;
//! use bulletin::runtime::BulletinRuntime;
//! use bulletin::store::MemoryBackend;
//!
//! let backend = Arc::new(MemoryBackend::new(Arc::new(SystemClock)));
//!
//! let runtime = BulletinRuntime::builder()
//!     .backend(backend)
//!     .converge_interval(std::time::Duration::from_secs(30))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // Desire LRPs and tasks through the board...
//! runtime.bbs().desired_lrps().desire_lrp(lrp).await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bbs::{Bbs, BbsDependencies};
use crate::clients::{
    AuctioneerClient, CellClient, DEFAULT_RPC_TIMEOUT, HttpAuctioneerClient, HttpCellClient,
    HttpTaskCallbackClient, TaskCallbackClient,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::converger::{Converge, ConvergenceWorker};
use crate::lrp::RestartCalculator;
use crate::metrics::{FacadeMetrics, MetricsSink};
use crate::store::KvBackend;
use crate::task::TaskConvergenceConfig;

/// Builder for creating a [`BulletinRuntime`].
pub struct BulletinRuntimeBuilder {
    backend: Option<Arc<dyn KvBackend>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    auctioneer: Option<Arc<dyn AuctioneerClient>>,
    cells: Option<Arc<dyn CellClient>>,
    callbacks: Option<Arc<dyn TaskCallbackClient>>,
    rpc_timeout: Duration,
    converge_interval: Duration,
    task_convergence: TaskConvergenceConfig,
    restart: RestartCalculator,
}

impl Default for BulletinRuntimeBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(FacadeMetrics),
            auctioneer: None,
            cells: None,
            callbacks: None,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            converge_interval: Duration::from_secs(30),
            task_convergence: TaskConvergenceConfig::default(),
            restart: RestartCalculator::default(),
        }
    }
}

impl BulletinRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take intervals, thresholds and the RPC timeout from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.converge_interval = config.converge_interval;
        self.task_convergence = TaskConvergenceConfig::from(config);
        self.rpc_timeout = config.rpc_timeout;
        self
    }

    /// Set the store backend (required).
    pub fn backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the time source.
    ///
    /// Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the metrics destination.
    ///
    /// Default: [`FacadeMetrics`].
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the auctioneer client.
    ///
    /// Default: HTTP with the configured RPC timeout.
    pub fn auctioneer_client(mut self, client: Arc<dyn AuctioneerClient>) -> Self {
        self.auctioneer = Some(client);
        self
    }

    /// Set the cell client.
    ///
    /// Default: HTTP with the configured RPC timeout.
    pub fn cell_client(mut self, client: Arc<dyn CellClient>) -> Self {
        self.cells = Some(client);
        self
    }

    /// Set the task callback client.
    ///
    /// Default: HTTP with the configured RPC timeout.
    pub fn callback_client(mut self, client: Arc<dyn TaskCallbackClient>) -> Self {
        self.callbacks = Some(client);
        self
    }

    /// Set the timeout of the default HTTP clients.
    ///
    /// Default: 1 second
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set how often both convergence engines run.
    ///
    /// Default: 30 seconds
    pub fn converge_interval(mut self, interval: Duration) -> Self {
        self.converge_interval = interval;
        self
    }

    /// Set the task convergence thresholds.
    pub fn task_convergence(mut self, config: TaskConvergenceConfig) -> Self {
        self.task_convergence = config;
        self
    }

    /// Set the crash restart policy.
    pub fn restart_calculator(mut self, restart: RestartCalculator) -> Self {
        self.restart = restart;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if the backend is missing, the interval is zero, or a
    /// default HTTP client cannot be created.
    pub fn build(self) -> Result<BulletinRuntimeConfig> {
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend is required"))?;
        if self.converge_interval.is_zero() {
            anyhow::bail!("converge_interval must be positive");
        }

        let auctioneer: Arc<dyn AuctioneerClient> = match self.auctioneer {
            Some(client) => client,
            None => Arc::new(HttpAuctioneerClient::new(self.rpc_timeout)?),
        };
        let cells: Arc<dyn CellClient> = match self.cells {
            Some(client) => client,
            None => Arc::new(HttpCellClient::new(self.rpc_timeout)?),
        };
        let callbacks: Arc<dyn TaskCallbackClient> = match self.callbacks {
            Some(client) => client,
            None => Arc::new(HttpTaskCallbackClient::new(self.rpc_timeout)?),
        };

        Ok(BulletinRuntimeConfig {
            deps: BbsDependencies {
                backend,
                clock: self.clock,
                metrics: self.metrics,
                auctioneer,
                cells,
                callbacks,
                task_convergence: self.task_convergence,
                restart: self.restart,
            },
            converge_interval: self.converge_interval,
        })
    }
}

/// Configuration for a [`BulletinRuntime`].
pub struct BulletinRuntimeConfig {
    deps: BbsDependencies,
    converge_interval: Duration,
}

impl BulletinRuntimeConfig {
    /// Start the runtime, spawning both convergence workers and the
    /// completion callback worker.
    pub async fn start(self) -> Result<BulletinRuntime> {
        let (bbs, completion_worker) = Bbs::new(self.deps);

        let lrp_engine: Arc<dyn Converge> = bbs.lrp_convergence().clone();
        let lrp_worker = ConvergenceWorker::new(lrp_engine, self.converge_interval);
        let lrp_shutdown = lrp_worker.shutdown_handle();
        let lrp_handle = tokio::spawn(lrp_worker.run());

        let task_engine: Arc<dyn Converge> = bbs.task_convergence().clone();
        let task_worker = ConvergenceWorker::new(task_engine, self.converge_interval);
        let task_shutdown = task_worker.shutdown_handle();
        let task_handle = tokio::spawn(task_worker.run());

        let completion_shutdown = completion_worker.shutdown_handle();
        let completion_handle = tokio::spawn(completion_worker.run());

        info!(
            converge_interval_secs = self.converge_interval.as_secs_f64(),
            "BulletinRuntime started"
        );

        Ok(BulletinRuntime {
            bbs,
            lrp_handle,
            task_handle,
            completion_handle,
            lrp_shutdown,
            task_shutdown,
            completion_shutdown,
        })
    }
}

/// A running bulletin board that can be embedded in an application.
///
/// The runtime manages:
/// - LRP convergence on a fixed interval
/// - Task convergence on the same interval
/// - Delivery of task completion callbacks
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BulletinRuntime {
    bbs: Bbs,
    lrp_handle: JoinHandle<()>,
    task_handle: JoinHandle<()>,
    completion_handle: JoinHandle<()>,
    lrp_shutdown: Arc<Notify>,
    task_shutdown: Arc<Notify>,
    completion_shutdown: Arc<Notify>,
}

impl BulletinRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BulletinRuntimeBuilder {
        BulletinRuntimeBuilder::new()
    }

    /// The board the workers act on.
    pub fn bbs(&self) -> &Bbs {
        &self.bbs
    }

    /// Gracefully shut down the runtime.
    ///
    /// Convergence stops first; queued completion callbacks are flushed
    /// before the callback worker exits.
    pub async fn shutdown(self) -> Result<()> {
        info!("BulletinRuntime shutting down...");

        self.lrp_shutdown.notify_one();
        self.task_shutdown.notify_one();

        let mut panicked = false;
        if let Err(e) = self.lrp_handle.await {
            error!("LRP convergence task panicked: {}", e);
            panicked = true;
        }
        if let Err(e) = self.task_handle.await {
            error!("Task convergence task panicked: {}", e);
            panicked = true;
        }

        self.completion_shutdown.notify_one();
        if let Err(e) = self.completion_handle.await {
            error!("Completion worker task panicked: {}", e);
            panicked = true;
        }

        if panicked {
            anyhow::bail!("a bulletin worker panicked");
        }
        info!("BulletinRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.lrp_handle.is_finished()
            && !self.task_handle.is_finished()
            && !self.completion_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MockAuctioneerClient, MockCellClient, MockTaskCallbackClient};
    use crate::clock::FakeClock;
    use crate::metrics::InMemoryMetrics;
    use crate::store::MemoryBackend;
    use chrono::Utc;

    #[test]
    fn test_backend_is_required() {
        let err = BulletinRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("backend is required"));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let err = BulletinRuntime::builder()
            .backend(Arc::new(MemoryBackend::new(clock)))
            .converge_interval(Duration::ZERO)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("converge_interval"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_converges_until_shutdown() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let metrics = Arc::new(InMemoryMetrics::new());
        let runtime = BulletinRuntime::builder()
            .backend(Arc::new(MemoryBackend::new(clock.clone())))
            .clock(clock)
            .metrics(metrics.clone())
            .auctioneer_client(Arc::new(MockAuctioneerClient::new()))
            .cell_client(Arc::new(MockCellClient::new()))
            .callback_client(Arc::new(MockTaskCallbackClient::new()))
            .converge_interval(Duration::from_secs(5))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(metrics.counter(crate::metrics::CONVERGENCE_LRP_RUNS), 2);
        assert_eq!(metrics.counter(crate::metrics::CONVERGENCE_TASK_RUNS), 2);

        runtime.shutdown().await.unwrap();
    }
}
