// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The assembled bulletin board.
//!
//! [`Bbs`] wires every component to the same store, clock, metrics sink and
//! outbound clients. Nothing is global: two boards built from two backends
//! are fully independent, which is how the integration tests run.

use std::sync::Arc;

use crate::clients::{AuctioneerClient, CellClient, TaskCallbackClient};
use crate::clock::Clock;
use crate::domains::DomainRegistry;
use crate::lrp::{ActualLrpRepo, DesiredLrpStore, Evacuator, LrpConvergence, LrpLifecycle, RestartCalculator};
use crate::metrics::MetricsSink;
use crate::models::{DesiredLrp, Task};
use crate::services::ServicesRegistry;
use crate::store::{KvBackend, StoreGateway};
use crate::task::{
    CompletionWorker, TaskConvergence, TaskConvergenceConfig, TaskLifecycle, completion_channel,
};
use crate::watcher::{self, EventStream, WatchedActualLrp};

/// Everything a [`Bbs`] depends on.
pub struct BbsDependencies {
    /// Store backend.
    pub backend: Arc<dyn KvBackend>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Metrics destination.
    pub metrics: Arc<dyn MetricsSink>,
    /// Auction requests.
    pub auctioneer: Arc<dyn AuctioneerClient>,
    /// Stop and cancel requests to cells.
    pub cells: Arc<dyn CellClient>,
    /// Task completion callbacks.
    pub callbacks: Arc<dyn TaskCallbackClient>,
    /// Task convergence thresholds.
    pub task_convergence: TaskConvergenceConfig,
    /// Crash restart policy.
    pub restart: RestartCalculator,
}

/// Handle to every bulletin component.
#[derive(Clone)]
pub struct Bbs {
    gateway: StoreGateway,
    services: ServicesRegistry,
    domains: DomainRegistry,
    lrps: LrpLifecycle,
    desired: DesiredLrpStore,
    evacuator: Evacuator,
    tasks: TaskLifecycle,
    lrp_convergence: Arc<LrpConvergence>,
    task_convergence: Arc<TaskConvergence>,
}

impl Bbs {
    /// Assemble a board. The returned worker delivers task completion
    /// callbacks and must be run for callbacks to go out.
    pub fn new(deps: BbsDependencies) -> (Self, CompletionWorker) {
        let gateway = StoreGateway::new(deps.backend);
        let services = ServicesRegistry::new(gateway.clone());

        let lrps = LrpLifecycle::new(
            gateway.clone(),
            services.clone(),
            deps.auctioneer.clone(),
            deps.cells.clone(),
            deps.clock.clone(),
        )
        .with_restart_calculator(deps.restart);

        let (dispatcher, completion_worker) =
            completion_channel(services.clone(), deps.callbacks.clone());
        let tasks = TaskLifecycle::new(
            gateway.clone(),
            services.clone(),
            deps.auctioneer.clone(),
            deps.cells,
            deps.clock.clone(),
            dispatcher,
        );

        let lrp_convergence = LrpConvergence::new(
            gateway.clone(),
            lrps.clone(),
            services.clone(),
            deps.clock.clone(),
            deps.metrics.clone(),
        );
        let task_convergence = TaskConvergence::new(
            gateway.clone(),
            services.clone(),
            deps.auctioneer,
            deps.callbacks,
            deps.clock,
            deps.metrics,
            deps.task_convergence,
        );

        let bbs = Self {
            domains: DomainRegistry::new(gateway.clone()),
            desired: DesiredLrpStore::new(gateway.clone(), lrps.clone()),
            evacuator: Evacuator::new(lrps.clone()),
            lrp_convergence: Arc::new(lrp_convergence),
            task_convergence: Arc::new(task_convergence),
            gateway,
            services,
            lrps,
            tasks,
        };
        (bbs, completion_worker)
    }

    /// Raw store access.
    pub fn gateway(&self) -> &StoreGateway {
        &self.gateway
    }

    /// Presence lookups.
    pub fn services(&self) -> &ServicesRegistry {
        &self.services
    }

    /// Domain freshness.
    pub fn domains(&self) -> &DomainRegistry {
        &self.domains
    }

    /// Desired LRPs.
    pub fn desired_lrps(&self) -> &DesiredLrpStore {
        &self.desired
    }

    /// Actual LRP transitions.
    pub fn actual_lrps(&self) -> &LrpLifecycle {
        &self.lrps
    }

    /// Actual LRP reads and group queries.
    pub fn actual_lrp_repo(&self) -> &ActualLrpRepo {
        self.lrps.repo()
    }

    /// Evacuation protocol.
    pub fn evacuation(&self) -> &Evacuator {
        &self.evacuator
    }

    /// Task transitions and queries.
    pub fn tasks(&self) -> &TaskLifecycle {
        &self.tasks
    }

    /// LRP convergence engine.
    pub fn lrp_convergence(&self) -> &Arc<LrpConvergence> {
        &self.lrp_convergence
    }

    /// Task convergence engine.
    pub fn task_convergence(&self) -> &Arc<TaskConvergence> {
        &self.task_convergence
    }

    /// Stream of desired LRP changes.
    pub fn watch_desired_lrps(&self) -> EventStream<DesiredLrp> {
        watcher::watch_desired_lrps(&self.gateway)
    }

    /// Stream of actual LRP changes, both slots.
    pub fn watch_actual_lrps(&self) -> EventStream<WatchedActualLrp> {
        watcher::watch_actual_lrps(&self.gateway)
    }

    /// Stream of task changes.
    pub fn watch_tasks(&self) -> EventStream<Task> {
        watcher::watch_tasks(&self.gateway)
    }
}
