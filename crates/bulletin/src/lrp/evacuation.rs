// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Evacuation of instances off a draining cell.
//!
//! A draining cell keeps serving traffic from an evacuating copy of each
//! running instance while the instance slot is re-auctioned. The copy
//! carries a TTL so it disappears even if the cell never cleans up.

use std::time::Duration;

use tracing::{debug, info};

use super::actual::ActualLrpRepo;
use super::lifecycle::LrpLifecycle;
use crate::error::{BbsError, Result, Transition};
use crate::models::{
    ActualLrp, ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo, ActualLrpState,
    ModificationTag,
};
use crate::paths::{self, Slot};

/// Evacuation requests from draining cells.
#[derive(Clone)]
pub struct Evacuator {
    lifecycle: LrpLifecycle,
}

impl Evacuator {
    /// Evacuator sharing `lifecycle`'s store and clients.
    pub fn new(lifecycle: LrpLifecycle) -> Self {
        Self { lifecycle }
    }

    fn repo(&self) -> &ActualLrpRepo {
        self.lifecycle.repo()
    }

    /// Give up a claimed instance: drop the caller's evacuating copy and put
    /// the instance back up for auction.
    pub async fn evacuate_claimed_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<()> {
        key.validate()?;
        instance_key.validate()?;
        self.remove_owned_evacuating(key, instance_key).await?;

        let instance = match self.repo().instance(key).await {
            Ok((lrp, _)) => lrp,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if instance.instance_key != *instance_key {
            return Err(BbsError::cannot_be(Transition::Evacuated, instance.state));
        }

        if self.lifecycle.unclaim_actual_lrp(key).await? {
            self.lifecycle.request_auction_for(key).await;
        }
        info!(
            process_guid = %key.process_guid,
            index = key.index,
            cell_id = %instance_key.cell_id,
            "Evacuated claimed actual LRP"
        );
        Ok(())
    }

    /// Keep a running instance reachable from an evacuating copy while its
    /// instance slot is re-auctioned.
    pub async fn evacuate_running_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
        ttl: Duration,
    ) -> Result<()> {
        key.validate()?;
        instance_key.validate()?;

        let instance = match self.repo().instance(key).await {
            Ok((lrp, _)) => lrp,
            Err(e) if e.is_not_found() => {
                self.remove_owned_evacuating(key, instance_key).await?;
                return Err(BbsError::cannot_be(Transition::Evacuated, None));
            }
            Err(e) => return Err(e),
        };

        let owned = instance.instance_key == *instance_key;
        match (instance.state, owned) {
            (ActualLrpState::Unclaimed, _) | (ActualLrpState::Claimed, false) => {
                self.write_evacuating_if_free(&instance, instance_key, net_info, ttl)
                    .await
            }
            (ActualLrpState::Claimed, true) | (ActualLrpState::Running, true) => {
                let mut copy = instance.clone();
                copy.state = ActualLrpState::Running;
                copy.net_info = net_info.clone();
                self.repo().set_evacuating(&copy, ttl).await?;

                if self.lifecycle.unclaim_actual_lrp(key).await? {
                    self.lifecycle.request_auction_for(key).await;
                }
                info!(
                    process_guid = %key.process_guid,
                    index = key.index,
                    cell_id = %instance_key.cell_id,
                    ttl_secs = ttl.as_secs(),
                    "Evacuating running actual LRP"
                );
                Ok(())
            }
            (state, _) => {
                self.remove_owned_evacuating(key, instance_key).await?;
                Err(BbsError::cannot_be(Transition::Evacuated, state))
            }
        }
    }

    /// The instance stopped on the draining cell: drop both of the caller's
    /// records.
    pub async fn evacuate_stopped_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<()> {
        key.validate()?;
        instance_key.validate()?;
        self.remove_owned_evacuating(key, instance_key).await?;

        match self.repo().instance(key).await {
            Ok((lrp, index)) if lrp.instance_key == *instance_key => {
                match self.repo().compare_and_delete(key, Slot::Instance, index).await {
                    Err(e) if !e.is_not_found() => return Err(e),
                    _ => {}
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        debug!(process_guid = %key.process_guid, index = key.index, "Evacuated stopped actual LRP");
        Ok(())
    }

    /// The instance crashed on the draining cell: drop the caller's
    /// evacuating copy and crash the instance if the caller still owns it.
    pub async fn evacuate_crashed_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<()> {
        key.validate()?;
        instance_key.validate()?;
        self.remove_owned_evacuating(key, instance_key).await?;

        match self
            .lifecycle
            .crash_actual_lrp(key, instance_key, reason)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(BbsError::ActualLrpCannotBe { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete the evacuating copy iff it belongs to `instance_key`.
    pub async fn remove_evacuating_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<()> {
        let (evacuating, index) = self.repo().evacuating(key).await?;
        if evacuating.instance_key != *instance_key {
            return Err(BbsError::ComparisonFailed {
                key: paths::actual_lrp(&key.process_guid, key.index, Slot::Evacuating),
            });
        }
        self.repo()
            .compare_and_delete(key, Slot::Evacuating, index)
            .await
    }

    async fn remove_owned_evacuating(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<()> {
        match self.remove_evacuating_actual_lrp(key, instance_key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(BbsError::ComparisonFailed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Write the caller's evacuating copy unless another instance holds the
    /// slot.
    async fn write_evacuating_if_free(
        &self,
        instance: &ActualLrp,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
        ttl: Duration,
    ) -> Result<()> {
        let key = &instance.key;
        match self.repo().evacuating(key).await {
            Ok((mut existing, index)) if existing.instance_key == *instance_key => {
                existing.net_info = net_info.clone();
                existing.modification_tag.increment();
                self.repo()
                    .compare_and_swap_evacuating(&existing, ttl, index)
                    .await?;
                Ok(())
            }
            Ok(_) => Err(BbsError::cannot_be(Transition::Evacuated, instance.state)),
            Err(e) if e.is_not_found() => {
                let copy = ActualLrp {
                    key: key.clone(),
                    instance_key: instance_key.clone(),
                    net_info: net_info.clone(),
                    crash_count: instance.crash_count,
                    crash_reason: String::new(),
                    state: ActualLrpState::Running,
                    placement_error: String::new(),
                    since: instance.since,
                    modification_tag: ModificationTag::new_epoch(),
                };
                match self.repo().create(&copy, Slot::Evacuating, Some(ttl)).await {
                    Ok(_) => Ok(()),
                    Err(BbsError::ResourceExists { .. }) => {
                        Err(BbsError::cannot_be(Transition::Evacuated, instance.state))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}
