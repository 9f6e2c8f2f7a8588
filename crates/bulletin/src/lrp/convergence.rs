// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic reconciliation of desired and actual LRPs.
//!
//! A run has three phases:
//!
//! 1. [`LrpConvergence::gather_and_prune`] snapshots the store, deleting
//!    records that cannot be decoded. Actual LRPs are listed before desired
//!    ones so an instance is never seen without the desired LRP that
//!    created it.
//! 2. [`calculate_convergence`] decides, without I/O, what is missing, extra,
//!    restartable, stranded on a vanished cell or stuck unclaimed.
//! 3. [`LrpConvergence::resolve`] applies the decisions and sends every
//!    resulting auction request in one call.
//!
//! Retirement is gated on domain freshness: while a domain's owner is not
//! refreshing it, no instance of that domain is retired.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use super::lifecycle::LrpLifecycle;
use super::restart::{RestartCalculator, STALE_UNCLAIMED_DURATION};
use crate::clock::{Clock, elapsed};
use crate::converger::Converge;
use crate::domains::DomainRegistry;
use crate::error::{BbsError, Result};
use crate::metrics::{self, MetricsSink};
use crate::models::{
    ActualLrp, ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo, ActualLrpState, DesiredLrp,
    LrpStartRequest,
};
use crate::paths::{self, Slot};
use crate::services::ServicesRegistry;
use crate::store::{StoreGateway, StoreNode, decode};
use crate::work_pool::{CONVERGENCE_WORKERS, WorkPool};

/// An actual LRP together with the store index it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredActualLrp {
    /// Decoded record.
    pub lrp: ActualLrp,
    /// Modification index of the read.
    pub store_index: u64,
}

/// Snapshot convergence decides on.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceInput {
    /// Every process guid with a desired or an actual record.
    pub all_process_guids: BTreeSet<String>,
    /// Desired LRPs by process guid.
    pub desired_lrps: BTreeMap<String, DesiredLrp>,
    /// Instance-slot actual LRPs by process guid and index.
    pub actual_lrps: BTreeMap<String, BTreeMap<i32, StoredActualLrp>>,
    /// Fresh domains.
    pub domains: BTreeSet<String>,
    /// Ids of live cells.
    pub cells: BTreeSet<String>,
}

/// What a convergence run will do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvergenceChanges {
    /// Desired indices without an actual record.
    pub actual_lrp_keys_for_missing_indices: Vec<ActualLrpKey>,
    /// Actuals beyond the desired count, or with no desired LRP, in fresh domains.
    pub actual_lrps_for_extra_indices: Vec<StoredActualLrp>,
    /// Crashed actuals whose back-off has elapsed.
    pub restartable_crashed_actual_lrps: Vec<StoredActualLrp>,
    /// Actuals on cells that are no longer present.
    pub actual_lrps_with_missing_cells: Vec<StoredActualLrp>,
    /// Unclaimed actuals nobody has picked up for too long.
    pub stale_unclaimed_actual_lrps: Vec<StoredActualLrp>,
}

impl ConvergenceChanges {
    /// Whether the run has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.actual_lrp_keys_for_missing_indices.is_empty()
            && self.actual_lrps_for_extra_indices.is_empty()
            && self.restartable_crashed_actual_lrps.is_empty()
            && self.actual_lrps_with_missing_cells.is_empty()
            && self.stale_unclaimed_actual_lrps.is_empty()
    }
}

/// Decide what a run must change.
///
/// Each actual lands in at most one bucket; the first match wins in the
/// order extra, restartable crash, missing cell, stale unclaimed. Actuals
/// with no desired LRP are only ever retired, and only when their own domain
/// is fresh.
pub fn calculate_convergence(
    input: &ConvergenceInput,
    now_nanos: i64,
    restart: &RestartCalculator,
) -> ConvergenceChanges {
    let mut changes = ConvergenceChanges::default();
    let no_actuals = BTreeMap::new();

    for process_guid in &input.all_process_guids {
        let desired = input.desired_lrps.get(process_guid);
        let actuals = input.actual_lrps.get(process_guid).unwrap_or(&no_actuals);

        if let Some(desired) = desired {
            for index in 0..desired.instances {
                if !actuals.contains_key(&index) {
                    changes
                        .actual_lrp_keys_for_missing_indices
                        .push(ActualLrpKey::new(
                            desired.process_guid.clone(),
                            index,
                            desired.domain.clone(),
                        ));
                }
            }
        }

        for (index, stored) in actuals {
            let lrp = &stored.lrp;
            let fresh = input.domains.contains(&lrp.key.domain);

            match desired {
                None => {
                    if fresh {
                        changes.actual_lrps_for_extra_indices.push(stored.clone());
                    }
                    continue;
                }
                Some(desired) if *index >= desired.instances && fresh => {
                    changes.actual_lrps_for_extra_indices.push(stored.clone());
                    continue;
                }
                Some(_) => {}
            }

            if restart.should_restart_crash(lrp, now_nanos) {
                changes.restartable_crashed_actual_lrps.push(stored.clone());
            } else if !lrp.instance_key.cell_id.is_empty()
                && !input.cells.contains(&lrp.instance_key.cell_id)
            {
                changes.actual_lrps_with_missing_cells.push(stored.clone());
            } else if lrp.state == ActualLrpState::Unclaimed
                && elapsed(now_nanos, lrp.since) > STALE_UNCLAIMED_DURATION
            {
                changes.stale_unclaimed_actual_lrps.push(stored.clone());
            }
        }
    }

    changes
}

/// Start requests coalesced per process guid.
#[derive(Default)]
struct StartRequests {
    requests: Mutex<BTreeMap<String, (DesiredLrp, BTreeSet<i32>)>>,
}

impl StartRequests {
    fn add(&self, desired: &DesiredLrp, index: i32) {
        let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());
        requests
            .entry(desired.process_guid.clone())
            .or_insert_with(|| (desired.clone(), BTreeSet::new()))
            .1
            .insert(index);
    }

    fn into_requests(self) -> Vec<LrpStartRequest> {
        self.requests
            .into_inner()
            .unwrap_or_else(|p| p.into_inner())
            .into_values()
            .map(|(desired, indices)| LrpStartRequest::new(desired, indices.into_iter().collect()))
            .collect()
    }
}

/// LRP convergence engine.
pub struct LrpConvergence {
    gateway: StoreGateway,
    lifecycle: LrpLifecycle,
    services: ServicesRegistry,
    domains: DomainRegistry,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    pool: WorkPool,
}

impl LrpConvergence {
    /// Engine acting through `lifecycle`.
    pub fn new(
        gateway: StoreGateway,
        lifecycle: LrpLifecycle,
        services: ServicesRegistry,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            domains: DomainRegistry::new(gateway.clone()),
            gateway,
            lifecycle,
            services,
            clock,
            metrics,
            pool: WorkPool::new(CONVERGENCE_WORKERS),
        }
    }

    /// Run all three phases once, returning what was decided.
    pub async fn converge_lrps(&self) -> Result<ConvergenceChanges> {
        let started = Instant::now();
        let result = self.run().await;
        self.metrics
            .increment_counter(metrics::CONVERGENCE_LRP_RUNS, 1);
        self.metrics
            .record_duration(metrics::CONVERGENCE_LRP_DURATION, started.elapsed());
        result
    }

    async fn run(&self) -> Result<ConvergenceChanges> {
        let input = self.gather_and_prune().await?;
        let now = self.clock.now_nanos();
        let changes = calculate_convergence(&input, now, &self.lifecycle.restart_calculator());
        self.record_gauges(&input, &changes);

        info!(
            missing = changes.actual_lrp_keys_for_missing_indices.len(),
            extra = changes.actual_lrps_for_extra_indices.len(),
            restartable = changes.restartable_crashed_actual_lrps.len(),
            missing_cells = changes.actual_lrps_with_missing_cells.len(),
            stale_unclaimed = changes.stale_unclaimed_actual_lrps.len(),
            "Calculated LRP convergence"
        );

        self.resolve(&input, &changes).await;
        Ok(changes)
    }

    /// Snapshot actual LRPs, domains, desired LRPs and cells, deleting
    /// records that cannot be decoded.
    pub async fn gather_and_prune(&self) -> Result<ConvergenceInput> {
        let mut input = ConvergenceInput::default();

        let mut malformed_actuals = Vec::new();
        for node in self.gateway.list(paths::ACTUAL_LRP_ROOT).await? {
            let Some((process_guid, index, slot)) = paths::parse_actual_lrp(&node.key) else {
                warn!(key = %node.key, "Pruning actual LRP with unexpected key");
                malformed_actuals.push(node);
                continue;
            };
            let lrp: ActualLrp = match decode(&node) {
                Ok(lrp) => lrp,
                Err(e) => {
                    warn!(key = %node.key, error = %e, "Pruning malformed actual LRP");
                    malformed_actuals.push(node);
                    continue;
                }
            };
            if slot == Slot::Evacuating {
                continue;
            }
            input.all_process_guids.insert(process_guid.to_string());
            input
                .actual_lrps
                .entry(process_guid.to_string())
                .or_default()
                .insert(
                    index,
                    StoredActualLrp {
                        lrp,
                        store_index: node.index,
                    },
                );
        }

        input.domains = self.domains.domains().await?;

        let mut malformed_desired = Vec::new();
        for node in self.gateway.list(paths::DESIRED_LRP_ROOT).await? {
            match decode::<DesiredLrp>(&node) {
                Ok(desired) => {
                    input.all_process_guids.insert(desired.process_guid.clone());
                    input
                        .desired_lrps
                        .insert(desired.process_guid.clone(), desired);
                }
                Err(e) => {
                    warn!(key = %node.key, error = %e, "Pruning malformed desired LRP");
                    malformed_desired.push(node);
                }
            }
        }

        input.cells = self.services.cells().await?.into_keys().collect();

        let pruned_actuals = self.prune(&malformed_actuals).await;
        let pruned_desired = self.prune(&malformed_desired).await;
        self.metrics.increment_counter(
            metrics::CONVERGENCE_LRP_PRE_PROCESSING_ACTUAL_LRPS_DELETED,
            pruned_actuals,
        );
        self.metrics.increment_counter(
            metrics::CONVERGENCE_LRP_PRE_PROCESSING_DESIRED_LRPS_DELETED,
            pruned_desired,
        );

        Ok(input)
    }

    async fn prune(&self, nodes: &[StoreNode]) -> u64 {
        let gateway = &self.gateway;
        let results = self
            .pool
            .run(nodes.iter().map(move |node| async move {
                let result = gateway
                    .compare_and_delete_by_index(&node.key, node.index)
                    .await;
                if let Err(e) = &result {
                    warn!(key = %node.key, error = %e, "Failed to prune record");
                }
                result.is_ok()
            }))
            .await;
        results.into_iter().filter(|deleted| *deleted).count() as u64
    }

    /// Apply `changes`, then send the collected auction requests at once.
    pub async fn resolve(&self, input: &ConvergenceInput, changes: &ConvergenceChanges) {
        let extras: Vec<ActualLrpKey> = changes
            .actual_lrps_for_extra_indices
            .iter()
            .map(|stored| stored.lrp.key.clone())
            .collect();
        if !extras.is_empty() {
            self.lifecycle.retire_actual_lrps(&extras).await;
        }

        let starts = StartRequests::default();
        let mut work: Vec<BoxFuture<'_, ()>> = Vec::new();

        for key in &changes.actual_lrp_keys_for_missing_indices {
            work.push(self.create_missing(input, key, &starts).boxed());
        }
        for stored in &changes.actual_lrps_with_missing_cells {
            work.push(self.replace_on_missing_cell(input, stored, &starts).boxed());
        }
        for stored in &changes.restartable_crashed_actual_lrps {
            work.push(self.restart_crashed(input, stored, &starts).boxed());
        }
        for stored in &changes.stale_unclaimed_actual_lrps {
            let starts = &starts;
            work.push(
                async move {
                    queue_start(input, &stored.lrp.key, starts);
                }
                .boxed(),
            );
        }

        self.pool.run(work).await;

        let requests = starts.into_requests();
        if !requests.is_empty() {
            debug!(requests = requests.len(), "Requesting convergence auctions");
            self.lifecycle.request_lrp_auctions(requests).await;
        }
    }

    async fn create_missing(
        &self,
        input: &ConvergenceInput,
        key: &ActualLrpKey,
        starts: &StartRequests,
    ) {
        match self.lifecycle.repo().create_unclaimed(key).await {
            Ok(_) => queue_start(input, key, starts),
            Err(BbsError::ResourceExists { .. }) => {}
            Err(e) => warn!(
                process_guid = %key.process_guid,
                index = key.index,
                error = %e,
                "Failed to create missing actual LRP"
            ),
        }
    }

    async fn replace_on_missing_cell(
        &self,
        input: &ConvergenceInput,
        stored: &StoredActualLrp,
        starts: &StartRequests,
    ) {
        let key = &stored.lrp.key;
        let repo = self.lifecycle.repo();
        if let Err(e) = repo
            .compare_and_delete(key, Slot::Instance, stored.store_index)
            .await
        {
            warn!(
                process_guid = %key.process_guid,
                index = key.index,
                error = %e,
                "Failed to remove actual LRP on missing cell"
            );
            return;
        }
        match repo.create_unclaimed(key).await {
            Ok(_) => {
                info!(
                    process_guid = %key.process_guid,
                    index = key.index,
                    cell_id = %stored.lrp.instance_key.cell_id,
                    "Replaced actual LRP on missing cell"
                );
                queue_start(input, key, starts);
            }
            Err(e) => warn!(
                process_guid = %key.process_guid,
                index = key.index,
                error = %e,
                "Failed to recreate actual LRP"
            ),
        }
    }

    async fn restart_crashed(
        &self,
        input: &ConvergenceInput,
        stored: &StoredActualLrp,
        starts: &StartRequests,
    ) {
        let mut lrp = stored.lrp.clone();
        lrp.state = ActualLrpState::Unclaimed;
        lrp.instance_key = ActualLrpInstanceKey::default();
        lrp.net_info = ActualLrpNetInfo::default();
        lrp.since = self.clock.now_nanos();
        lrp.modification_tag.increment();

        match self
            .lifecycle
            .repo()
            .compare_and_swap(&lrp, stored.store_index)
            .await
        {
            Ok(_) => {
                info!(
                    process_guid = %lrp.key.process_guid,
                    index = lrp.key.index,
                    crash_count = lrp.crash_count,
                    "Restarting crashed actual LRP"
                );
                queue_start(input, &lrp.key, starts);
            }
            Err(e) => warn!(
                process_guid = %lrp.key.process_guid,
                index = lrp.key.index,
                error = %e,
                "Failed to restart crashed actual LRP"
            ),
        }
    }

    fn record_gauges(&self, input: &ConvergenceInput, changes: &ConvergenceChanges) {
        let count = |state: ActualLrpState| {
            input
                .actual_lrps
                .values()
                .flat_map(BTreeMap::values)
                .filter(|stored| stored.lrp.state == state)
                .count() as f64
        };
        let desired: i64 = input
            .desired_lrps
            .values()
            .map(|d| i64::from(d.instances))
            .sum();

        self.metrics
            .set_gauge(metrics::LRPS_UNCLAIMED, count(ActualLrpState::Unclaimed));
        self.metrics
            .set_gauge(metrics::LRPS_CLAIMED, count(ActualLrpState::Claimed));
        self.metrics
            .set_gauge(metrics::LRPS_RUNNING, count(ActualLrpState::Running));
        self.metrics
            .set_gauge(metrics::LRPS_CRASHED, count(ActualLrpState::Crashed));
        self.metrics.set_gauge(metrics::LRPS_DESIRED, desired as f64);
        self.metrics.set_gauge(
            metrics::LRPS_MISSING,
            changes.actual_lrp_keys_for_missing_indices.len() as f64,
        );
        self.metrics.set_gauge(
            metrics::LRPS_EXTRA,
            changes.actual_lrps_for_extra_indices.len() as f64,
        );
    }
}

fn queue_start(input: &ConvergenceInput, key: &ActualLrpKey, starts: &StartRequests) {
    match input.desired_lrps.get(&key.process_guid) {
        Some(desired) => starts.add(desired, key.index),
        None => debug!(
            process_guid = %key.process_guid,
            index = key.index,
            "No desired LRP, not auctioning"
        ),
    }
}

#[async_trait]
impl Converge for LrpConvergence {
    fn name(&self) -> &'static str {
        "lrp-convergence"
    }

    async fn converge(&self) -> Result<()> {
        self.converge_lrps().await.map(|_| ())
    }
}
