// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired LRP records.

use tracing::{info, warn};

use super::lifecycle::LrpLifecycle;
use crate::error::Result;
use crate::models::{DesiredLrp, DesiredLrpFilter, DesiredLrpUpdate, ModificationTag};
use crate::paths;
use crate::store::{StoreGateway, decode};

/// Writes desired LRPs and keeps their instance ranges in step.
#[derive(Clone)]
pub struct DesiredLrpStore {
    gateway: StoreGateway,
    lifecycle: LrpLifecycle,
}

impl DesiredLrpStore {
    /// Store writing through `gateway`, creating and retiring instances via
    /// `lifecycle`.
    pub fn new(gateway: StoreGateway, lifecycle: LrpLifecycle) -> Self {
        Self { gateway, lifecycle }
    }

    /// Persist a new desired LRP and create its instances.
    ///
    /// Fails with `ResourceExists` if the process guid is taken.
    pub async fn desire_lrp(&self, mut lrp: DesiredLrp) -> Result<()> {
        lrp.validate()?;
        lrp.modification_tag = ModificationTag::new_epoch();

        self.gateway
            .create_json(&paths::desired_lrp(&lrp.process_guid), &lrp, None)
            .await?;
        info!(
            process_guid = %lrp.process_guid,
            domain = %lrp.domain,
            instances = lrp.instances,
            "Desired LRP"
        );

        self.lifecycle
            .start_instance_range(&lrp, 0, lrp.instances)
            .await;
        Ok(())
    }

    /// Apply `update` and grow or shrink the instance range to match.
    pub async fn update_desired_lrp(&self, process_guid: &str, update: &DesiredLrpUpdate) -> Result<()> {
        update.validate()?;

        let key = paths::desired_lrp(process_guid);
        let (mut lrp, index): (DesiredLrp, u64) = self.gateway.get_json(&key).await?;
        let previous = update.apply_to(&mut lrp);
        lrp.validate()?;
        lrp.modification_tag.increment();
        self.gateway.compare_and_swap_json(&key, &lrp, index).await?;

        info!(
            process_guid,
            from = previous,
            to = lrp.instances,
            "Updated desired LRP"
        );

        if lrp.instances > previous {
            self.lifecycle
                .start_instance_range(&lrp, previous, lrp.instances)
                .await;
        } else if lrp.instances < previous {
            self.lifecycle
                .stop_instance_range(process_guid, lrp.instances, previous)
                .await?;
        }
        Ok(())
    }

    /// Delete a desired LRP and retire its instances.
    pub async fn remove_desired_lrp(&self, process_guid: &str) -> Result<()> {
        let key = paths::desired_lrp(process_guid);
        let (lrp, _): (DesiredLrp, u64) = self.gateway.get_json(&key).await?;
        self.gateway.delete(&key).await?;
        info!(process_guid, instances = lrp.instances, "Removed desired LRP");

        self.lifecycle
            .stop_instance_range(process_guid, 0, lrp.instances)
            .await
    }

    /// Desired LRPs passing `filter`. Unreadable records are skipped.
    pub async fn desired_lrps(&self, filter: &DesiredLrpFilter) -> Result<Vec<DesiredLrp>> {
        let nodes = self.gateway.list(paths::DESIRED_LRP_ROOT).await?;
        Ok(nodes
            .iter()
            .filter_map(|node| match decode::<DesiredLrp>(node) {
                Ok(lrp) => Some(lrp),
                Err(e) => {
                    warn!(key = %node.key, error = %e, "Skipping unreadable desired LRP");
                    None
                }
            })
            .filter(|lrp| filter.matches(lrp))
            .collect())
    }

    /// One desired LRP.
    pub async fn desired_lrp_by_process_guid(&self, process_guid: &str) -> Result<DesiredLrp> {
        let (lrp, _) = self
            .gateway
            .get_json(&paths::desired_lrp(process_guid))
            .await?;
        Ok(lrp)
    }
}
