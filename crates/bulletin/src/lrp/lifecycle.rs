// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actual LRP state machine.
//!
//! Cells report instance progress through [`LrpLifecycle`]; every write is a
//! compare-and-swap against the index the record was read at, so concurrent
//! reporters for one `(process_guid, index)` are linearised by the store.
//!
//! ```text
//!              claim              start
//! UNCLAIMED ─────────► CLAIMED ─────────► RUNNING
//!     ▲                   │                  │
//!     │   crash (≤ 3)     │      crash       │
//!     ├───────────────────┴──────────────────┘
//!     │                   │ crash (> 3)
//!     │ restart policy    ▼
//!     └────────────── CRASHED
//! ```

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::actual::ActualLrpRepo;
use super::restart::{CRASH_RESET_TIMEOUT, RestartCalculator};
use crate::clients::{AuctioneerClient, CellClient};
use crate::clock::{Clock, elapsed};
use crate::error::{BbsError, Result, Transition};
use crate::models::{
    ActualLrp, ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo, ActualLrpState, DesiredLrp,
    LrpStartRequest,
};
use crate::paths::{self, Slot};
use crate::services::ServicesRegistry;
use crate::store::StoreGateway;
use crate::work_pool::{CREATE_WORKERS, RETIRE_WORKERS, WorkPool};

/// Attempts per key when retiring.
pub const MAX_RETIRE_ATTEMPTS: usize = 5;

/// Applies actual LRP transitions and the side effects that go with them.
#[derive(Clone)]
pub struct LrpLifecycle {
    repo: ActualLrpRepo,
    gateway: StoreGateway,
    services: ServicesRegistry,
    auctioneer: Arc<dyn AuctioneerClient>,
    cells: Arc<dyn CellClient>,
    clock: Arc<dyn Clock>,
    restart: RestartCalculator,
    retire_pool: WorkPool,
    create_pool: WorkPool,
}

impl LrpLifecycle {
    /// Lifecycle writing through `gateway`.
    pub fn new(
        gateway: StoreGateway,
        services: ServicesRegistry,
        auctioneer: Arc<dyn AuctioneerClient>,
        cells: Arc<dyn CellClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo: ActualLrpRepo::new(gateway.clone(), clock.clone()),
            gateway,
            services,
            auctioneer,
            cells,
            clock,
            restart: RestartCalculator::default(),
            retire_pool: WorkPool::new(RETIRE_WORKERS),
            create_pool: WorkPool::new(CREATE_WORKERS),
        }
    }

    /// Replace the restart policy.
    pub fn with_restart_calculator(mut self, restart: RestartCalculator) -> Self {
        self.restart = restart;
        self
    }

    /// Underlying repository.
    pub fn repo(&self) -> &ActualLrpRepo {
        &self.repo
    }

    /// Restart policy in use.
    pub fn restart_calculator(&self) -> RestartCalculator {
        self.restart
    }

    async fn read_instance(
        &self,
        key: &ActualLrpKey,
        transition: Transition,
    ) -> Result<(ActualLrp, u64)> {
        match self.repo.instance(key).await {
            Err(e) if e.is_not_found() => Err(BbsError::cannot_be(transition, None)),
            other => other,
        }
    }

    /// Stamp a transition onto `lrp`.
    fn touch(&self, lrp: &mut ActualLrp) {
        lrp.since = self.clock.now_nanos();
        lrp.modification_tag.increment();
    }

    /// Record that `instance_key` has reserved the instance.
    ///
    /// Claiming again with the same instance key succeeds without writing.
    /// A claim that loses a race to a concurrent writer fails with
    /// `CannotBeClaimed`.
    pub async fn claim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<()> {
        key.validate()?;
        instance_key.validate()?;

        let (mut lrp, index) = self.read_instance(key, Transition::Claimed).await?;
        let from = lrp.state;
        match from {
            ActualLrpState::Unclaimed => {}
            ActualLrpState::Claimed if lrp.instance_key == *instance_key => {
                debug!(process_guid = %key.process_guid, index = key.index, "Already claimed");
                return Ok(());
            }
            ActualLrpState::Running if lrp.instance_key == *instance_key => {}
            _ => return Err(BbsError::cannot_be(Transition::Claimed, from)),
        }

        lrp.state = ActualLrpState::Claimed;
        lrp.instance_key = instance_key.clone();
        lrp.net_info = ActualLrpNetInfo::default();
        lrp.placement_error.clear();
        self.touch(&mut lrp);

        match self.repo.compare_and_swap(&lrp, index).await {
            Ok(_) => {
                info!(
                    process_guid = %key.process_guid,
                    index = key.index,
                    cell_id = %instance_key.cell_id,
                    from = %from,
                    "Claimed actual LRP"
                );
                Ok(())
            }
            Err(BbsError::IndexMismatch { .. }) => Err(BbsError::cannot_be(Transition::Claimed, from)),
            Err(e) => Err(e),
        }
    }

    /// Record that the instance is up and reachable at `net_info`.
    ///
    /// Creates a fresh running record when none exists.
    pub async fn start_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
    ) -> Result<()> {
        key.validate()?;
        instance_key.validate()?;

        let (mut lrp, index) = match self.repo.instance(key).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                let lrp = ActualLrp::new_running(
                    key.clone(),
                    instance_key.clone(),
                    net_info.clone(),
                    self.clock.now_nanos(),
                );
                self.repo.create(&lrp, Slot::Instance, None).await?;
                info!(
                    process_guid = %key.process_guid,
                    index = key.index,
                    cell_id = %instance_key.cell_id,
                    "Started actual LRP without placeholder"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let from = lrp.state;
        match from {
            ActualLrpState::Unclaimed | ActualLrpState::Claimed => {}
            ActualLrpState::Running if lrp.instance_key == *instance_key => {
                if lrp.net_info == *net_info {
                    debug!(process_guid = %key.process_guid, index = key.index, "Already running");
                    return Ok(());
                }
            }
            _ => return Err(BbsError::cannot_be(Transition::Started, from)),
        }

        lrp.state = ActualLrpState::Running;
        lrp.instance_key = instance_key.clone();
        lrp.net_info = net_info.clone();
        lrp.placement_error.clear();
        self.touch(&mut lrp);
        self.repo.compare_and_swap(&lrp, index).await?;

        info!(
            process_guid = %key.process_guid,
            index = key.index,
            cell_id = %instance_key.cell_id,
            address = %net_info.address,
            from = %from,
            "Started actual LRP"
        );
        Ok(())
    }

    /// Record that the instance died.
    ///
    /// Up to the immediate-restart limit the record goes back to `Unclaimed`
    /// and is auctioned again; after that it waits in `Crashed` for the
    /// restart back-off.
    pub async fn crash_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<()> {
        key.validate()?;
        instance_key.validate()?;

        let (mut lrp, index) = self.repo.instance(key).await?;
        let from = lrp.state;
        let owned = lrp.instance_key == *instance_key;
        if !owned || !matches!(from, ActualLrpState::Claimed | ActualLrpState::Running) {
            return Err(BbsError::cannot_be(Transition::Crashed, from));
        }

        let now = self.clock.now_nanos();
        lrp.crash_count = if from == ActualLrpState::Running
            && elapsed(now, lrp.since) > CRASH_RESET_TIMEOUT
        {
            1
        } else {
            lrp.crash_count.saturating_add(1)
        };
        let restart = self.restart.should_restart_immediately(lrp.crash_count);

        lrp.state = if restart {
            ActualLrpState::Unclaimed
        } else {
            ActualLrpState::Crashed
        };
        lrp.crash_reason = reason.to_string();
        lrp.instance_key = ActualLrpInstanceKey::default();
        lrp.net_info = ActualLrpNetInfo::default();
        self.touch(&mut lrp);
        self.repo.compare_and_swap(&lrp, index).await?;

        info!(
            process_guid = %key.process_guid,
            index = key.index,
            crash_count = lrp.crash_count,
            restart,
            reason,
            "Crashed actual LRP"
        );

        if restart {
            self.request_auction_for(key).await;
        }
        Ok(())
    }

    /// Record that the instance could not be placed.
    pub async fn fail_actual_lrp(&self, key: &ActualLrpKey, error_message: &str) -> Result<()> {
        key.validate()?;

        let (mut lrp, index) = self.repo.instance(key).await?;
        if lrp.state != ActualLrpState::Unclaimed {
            return Err(BbsError::cannot_be(Transition::Failed, lrp.state));
        }

        lrp.placement_error = error_message.to_string();
        self.touch(&mut lrp);
        self.repo.compare_and_swap(&lrp, index).await?;

        warn!(
            process_guid = %key.process_guid,
            index = key.index,
            placement_error = error_message,
            "Failed to place actual LRP"
        );
        Ok(())
    }

    /// Delete the instance record iff it still matches both keys.
    pub async fn remove_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<()> {
        let (lrp, index) = self.repo.instance(key).await?;
        if lrp.key != *key || lrp.instance_key != *instance_key {
            return Err(BbsError::ComparisonFailed {
                key: paths::actual_lrp(&key.process_guid, key.index, Slot::Instance),
            });
        }
        self.repo.compare_and_delete(key, Slot::Instance, index).await?;
        info!(process_guid = %key.process_guid, index = key.index, "Removed actual LRP");
        Ok(())
    }

    /// Return the instance record to `Unclaimed`, dropping its instance key
    /// and net info. Returns whether anything changed.
    pub async fn unclaim_actual_lrp(&self, key: &ActualLrpKey) -> Result<bool> {
        let (mut lrp, index) = self.repo.instance(key).await?;
        if lrp.state == ActualLrpState::Unclaimed {
            return Ok(false);
        }

        let from = lrp.state;
        lrp.state = ActualLrpState::Unclaimed;
        lrp.instance_key = ActualLrpInstanceKey::default();
        lrp.net_info = ActualLrpNetInfo::default();
        self.touch(&mut lrp);
        self.repo.compare_and_swap(&lrp, index).await?;

        info!(
            process_guid = %key.process_guid,
            index = key.index,
            from = %from,
            "Unclaimed actual LRP"
        );
        Ok(true)
    }

    /// Take instances out of service.
    ///
    /// Records nobody runs are deleted; running ones are stopped through
    /// their cell, or deleted if the cell is gone. Failures are logged, never
    /// returned.
    pub async fn retire_actual_lrps(&self, keys: &[ActualLrpKey]) {
        self.retire_pool
            .run(keys.iter().map(|key| self.retire_with_retries(key)))
            .await;
    }

    async fn retire_with_retries(&self, key: &ActualLrpKey) {
        for attempt in 1..=MAX_RETIRE_ATTEMPTS {
            match self.retire(key).await {
                Ok(()) => return,
                Err(e) if e.is_not_found() => return,
                Err(e) if e.is_retryable() && attempt < MAX_RETIRE_ATTEMPTS => {
                    warn!(
                        process_guid = %key.process_guid,
                        index = key.index,
                        attempt,
                        error = %e,
                        "Retiring actual LRP failed, retrying"
                    );
                }
                Err(e) => {
                    error!(
                        process_guid = %key.process_guid,
                        index = key.index,
                        attempt,
                        error = %e,
                        "Failed to retire actual LRP"
                    );
                    return;
                }
            }
        }
    }

    async fn retire(&self, key: &ActualLrpKey) -> Result<()> {
        let (lrp, index) = self.repo.instance(key).await?;
        match lrp.state {
            ActualLrpState::Unclaimed | ActualLrpState::Crashed => {
                self.repo.compare_and_delete(key, Slot::Instance, index).await?;
                debug!(process_guid = %key.process_guid, index = key.index, "Deleted idle actual LRP");
            }
            ActualLrpState::Claimed | ActualLrpState::Running => {
                match self.services.cell_by_id(&lrp.instance_key.cell_id).await {
                    Ok(cell) => {
                        self.cells
                            .stop_lrp_instance(&cell.rep_address, &lrp.key, &lrp.instance_key)
                            .await?;
                        debug!(
                            process_guid = %key.process_guid,
                            index = key.index,
                            cell_id = %cell.cell_id,
                            "Asked cell to stop actual LRP"
                        );
                    }
                    Err(e) if e.is_not_found() => {
                        self.repo.compare_and_delete(key, Slot::Instance, index).await?;
                        debug!(
                            process_guid = %key.process_guid,
                            index = key.index,
                            "Deleted actual LRP on missing cell"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Create placeholders for `[lower, upper)` and auction the ones created.
    ///
    /// Indices that already have a record are left alone. Returns the
    /// indices that were created.
    pub async fn start_instance_range(&self, desired: &DesiredLrp, lower: i32, upper: i32) -> Vec<i32> {
        let repo = &self.repo;
        let results = self
            .create_pool
            .run((lower.max(0)..upper).map(move |index| {
                let key = ActualLrpKey::new(&desired.process_guid, index, &desired.domain);
                async move { (index, repo.create_unclaimed(&key).await) }
            }))
            .await;

        let mut created = Vec::new();
        for (index, result) in results {
            match result {
                Ok(_) => created.push(index),
                Err(BbsError::ResourceExists { .. }) => {}
                Err(e) => error!(
                    process_guid = %desired.process_guid,
                    index,
                    error = %e,
                    "Failed to create actual LRP"
                ),
            }
        }

        if !created.is_empty() {
            info!(
                process_guid = %desired.process_guid,
                created = created.len(),
                "Created actual LRPs"
            );
            self.request_lrp_auctions(vec![LrpStartRequest::new(desired.clone(), created.clone())])
                .await;
        }
        created
    }

    /// Retire the instance records of `process_guid` in `[lower, upper)`.
    pub async fn stop_instance_range(&self, process_guid: &str, lower: i32, upper: i32) -> Result<()> {
        let groups = self.repo.groups_by_process_guid(process_guid).await?;
        let keys: Vec<ActualLrpKey> = groups
            .range(lower..upper.max(lower))
            .filter_map(|(_, group)| group.instance.as_ref().map(|lrp| lrp.key.clone()))
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        info!(process_guid, lower, upper, count = keys.len(), "Retiring actual LRPs");
        self.retire_actual_lrps(&keys).await;
        Ok(())
    }

    /// Auction one index, reading its desired LRP. Best effort.
    pub(crate) async fn request_auction_for(&self, key: &ActualLrpKey) {
        match self
            .gateway
            .get_json::<DesiredLrp>(&paths::desired_lrp(&key.process_guid))
            .await
        {
            Ok((desired, _)) => {
                self.request_lrp_auctions(vec![LrpStartRequest::new(desired, vec![key.index])])
                    .await
            }
            Err(e) => warn!(
                process_guid = %key.process_guid,
                index = key.index,
                error = %e,
                "No desired LRP to auction"
            ),
        }
    }

    /// Send start requests to the auctioneer. Best effort.
    pub(crate) async fn request_lrp_auctions(&self, starts: Vec<LrpStartRequest>) {
        if starts.is_empty() {
            return;
        }
        let address = match self.services.auctioneer_address().await {
            Ok(address) => address,
            Err(e) => {
                warn!(error = %e, requests = starts.len(), "No auctioneer, skipping LRP auctions");
                return;
            }
        };
        if let Err(e) = self.auctioneer.request_lrp_auctions(&address, &starts).await {
            warn!(error = %e, requests = starts.len(), "Failed to request LRP auctions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MockAuctioneerClient, MockCellClient};
    use crate::clock::FakeClock;
    use crate::models::AuctioneerPresence;
    use crate::store::MemoryBackend;
    use std::time::Duration;

    struct Fixture {
        lifecycle: LrpLifecycle,
        clock: Arc<FakeClock>,
        auctioneer: Arc<MockAuctioneerClient>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(FakeClock::default());
        let gateway = StoreGateway::new(Arc::new(MemoryBackend::new(clock.clone())));
        gateway
            .set_json_with_ttl(
                paths::AUCTIONEER_LOCK,
                &AuctioneerPresence {
                    auctioneer_id: "a".to_string(),
                    auctioneer_address: "http://auctioneer".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        let auctioneer = Arc::new(MockAuctioneerClient::new());
        let lifecycle = LrpLifecycle::new(
            gateway.clone(),
            ServicesRegistry::new(gateway),
            auctioneer.clone(),
            Arc::new(MockCellClient::new()),
            clock.clone(),
        );
        Fixture {
            lifecycle,
            clock,
            auctioneer,
        }
    }

    fn key() -> ActualLrpKey {
        ActualLrpKey::new("pg", 0, "d")
    }

    #[tokio::test]
    async fn test_claim_missing_record_is_rejected() {
        let f = fixture().await;
        let err = f
            .lifecycle
            .claim_actual_lrp(&key(), &ActualLrpInstanceKey::new("ig", "cell-a"))
            .await
            .unwrap_err();
        assert_eq!(err, BbsError::cannot_be(Transition::Claimed, None));
        assert_eq!(err.error_code(), "cannot_be_claimed");
    }

    #[tokio::test]
    async fn test_crash_count_resets_after_long_run() {
        let f = fixture().await;
        let ik = ActualLrpInstanceKey::new("ig", "cell-a");
        let net = ActualLrpNetInfo::new("10.0.0.1", vec![]);

        let (mut lrp, index) = f.lifecycle.repo().create_unclaimed(&key()).await.unwrap();
        lrp.crash_count = 3;
        f.lifecycle.repo().compare_and_swap(&lrp, index).await.unwrap();

        f.lifecycle.start_actual_lrp(&key(), &ik, &net).await.unwrap();
        f.clock.advance(CRASH_RESET_TIMEOUT + Duration::from_secs(1));
        f.lifecycle.crash_actual_lrp(&key(), &ik, "oom").await.unwrap();

        let (lrp, _) = f.lifecycle.repo().instance(&key()).await.unwrap();
        assert_eq!(lrp.crash_count, 1);
        assert_eq!(lrp.state, ActualLrpState::Unclaimed);
        assert_eq!(lrp.crash_reason, "oom");
        assert!(lrp.instance_key.is_empty());
    }

    #[tokio::test]
    async fn test_unclaim_is_noop_on_unclaimed() {
        let f = fixture().await;
        f.lifecycle.repo().create_unclaimed(&key()).await.unwrap();
        assert!(!f.lifecycle.unclaim_actual_lrp(&key()).await.unwrap());
        assert!(f.auctioneer.lrp_calls().await.is_empty());
    }
}
