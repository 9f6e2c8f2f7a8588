// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed access to actual LRP records.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::clock::Clock;
use crate::error::{BbsError, Result};
use crate::models::{ActualLrp, ActualLrpFilter, ActualLrpGroup, ActualLrpKey};
use crate::paths::{self, Slot};
use crate::store::{StoreGateway, StoreNode, decode};

/// Reads and writes actual LRPs in both slots.
#[derive(Clone)]
pub struct ActualLrpRepo {
    gateway: StoreGateway,
    clock: Arc<dyn Clock>,
}

impl ActualLrpRepo {
    /// Repository over `gateway`.
    pub fn new(gateway: StoreGateway, clock: Arc<dyn Clock>) -> Self {
        Self { gateway, clock }
    }

    /// Record in `slot` with its store index.
    pub async fn get(
        &self,
        process_guid: &str,
        index: i32,
        slot: Slot,
    ) -> Result<(ActualLrp, u64)> {
        self.gateway
            .get_json(&paths::actual_lrp(process_guid, index, slot))
            .await
    }

    /// Instance record with its store index.
    pub async fn instance(&self, key: &ActualLrpKey) -> Result<(ActualLrp, u64)> {
        self.get(&key.process_guid, key.index, Slot::Instance).await
    }

    /// Evacuating record with its store index.
    pub async fn evacuating(&self, key: &ActualLrpKey) -> Result<(ActualLrp, u64)> {
        self.get(&key.process_guid, key.index, Slot::Evacuating)
            .await
    }

    /// Write a fresh unclaimed placeholder; `ResourceExists` if the slot is taken.
    pub async fn create_unclaimed(&self, key: &ActualLrpKey) -> Result<(ActualLrp, u64)> {
        let lrp = ActualLrp::new_unclaimed(key.clone(), self.clock.now_nanos());
        let index = self.create(&lrp, Slot::Instance, None).await?;
        Ok((lrp, index))
    }

    /// Create `lrp` in `slot`. Records that break the per-state invariants
    /// are refused.
    pub async fn create(&self, lrp: &ActualLrp, slot: Slot, ttl: Option<Duration>) -> Result<u64> {
        lrp.validate()?;
        let key = paths::actual_lrp(&lrp.key.process_guid, lrp.key.index, slot);
        let node = self.gateway.create_json(&key, lrp, ttl).await?;
        Ok(node.index)
    }

    /// Overwrite the instance record last written at `store_index`.
    pub async fn compare_and_swap(&self, lrp: &ActualLrp, store_index: u64) -> Result<u64> {
        lrp.validate()?;
        let key = paths::actual_lrp(&lrp.key.process_guid, lrp.key.index, Slot::Instance);
        let node = self
            .gateway
            .compare_and_swap_json(&key, lrp, store_index)
            .await?;
        Ok(node.index)
    }

    /// Delete the record in `slot` last written at `store_index`.
    pub async fn compare_and_delete(
        &self,
        key: &ActualLrpKey,
        slot: Slot,
        store_index: u64,
    ) -> Result<()> {
        self.gateway
            .compare_and_delete_by_index(
                &paths::actual_lrp(&key.process_guid, key.index, slot),
                store_index,
            )
            .await
    }

    /// Write the evacuating copy unconditionally, expiring after `ttl`.
    pub async fn set_evacuating(&self, lrp: &ActualLrp, ttl: Duration) -> Result<u64> {
        lrp.validate()?;
        let key = paths::actual_lrp(&lrp.key.process_guid, lrp.key.index, Slot::Evacuating);
        let node = self.gateway.set_json_with_ttl(&key, lrp, Some(ttl)).await?;
        Ok(node.index)
    }

    /// Replace the evacuating copy last written at `store_index`.
    pub async fn compare_and_swap_evacuating(
        &self,
        lrp: &ActualLrp,
        ttl: Duration,
        store_index: u64,
    ) -> Result<u64> {
        lrp.validate()?;
        let key = paths::actual_lrp(&lrp.key.process_guid, lrp.key.index, Slot::Evacuating);
        let value = serde_json::to_vec(lrp)?;
        let node = self
            .gateway
            .compare_and_swap_by_index_with_ttl(&key, value, Some(ttl), store_index)
            .await?;
        Ok(node.index)
    }

    /// Both slots of every index of a process. Unreadable records are skipped.
    pub async fn groups_by_process_guid(
        &self,
        process_guid: &str,
    ) -> Result<BTreeMap<i32, ActualLrpGroup>> {
        let nodes = self
            .gateway
            .list(&paths::actual_lrp_process_dir(process_guid))
            .await?;
        Ok(group_nodes(&nodes)
            .remove(process_guid)
            .unwrap_or_default())
    }

    /// Both slots of one index; `ResourceNotFound` when neither exists.
    pub async fn group(&self, process_guid: &str, index: i32) -> Result<ActualLrpGroup> {
        let nodes = self
            .gateway
            .list(&paths::actual_lrp_index_dir(process_guid, index))
            .await?;
        group_nodes(&nodes)
            .remove(process_guid)
            .and_then(|mut groups| groups.remove(&index))
            .ok_or_else(|| BbsError::ResourceNotFound {
                key: paths::actual_lrp_index_dir(process_guid, index),
            })
    }

    /// Every group with at least one slot passing `filter`.
    pub async fn groups(&self, filter: &ActualLrpFilter) -> Result<Vec<ActualLrpGroup>> {
        let nodes = self.gateway.list(paths::ACTUAL_LRP_ROOT).await?;
        Ok(group_nodes(&nodes)
            .into_values()
            .flat_map(BTreeMap::into_values)
            .filter(|group| {
                group.instance.iter().any(|lrp| filter.matches(lrp))
                    || group.evacuating.iter().any(|lrp| filter.matches(lrp))
            })
            .collect())
    }
}

fn group_nodes(nodes: &[StoreNode]) -> BTreeMap<String, BTreeMap<i32, ActualLrpGroup>> {
    let mut groups: BTreeMap<String, BTreeMap<i32, ActualLrpGroup>> = BTreeMap::new();
    for node in nodes {
        let Some((process_guid, index, slot)) = paths::parse_actual_lrp(&node.key) else {
            warn!(key = %node.key, "Skipping actual LRP with unexpected key");
            continue;
        };
        let lrp: ActualLrp = match decode(node) {
            Ok(lrp) => lrp,
            Err(e) => {
                warn!(key = %node.key, error = %e, "Skipping unreadable actual LRP");
                continue;
            }
        };
        let group = groups
            .entry(process_guid.to_string())
            .or_default()
            .entry(index)
            .or_default();
        match slot {
            Slot::Instance => group.instance = Some(lrp),
            Slot::Evacuating => group.evacuating = Some(lrp),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::models::{ActualLrpInstanceKey, ActualLrpNetInfo, ActualLrpState};
    use crate::store::MemoryBackend;

    fn repo() -> (StoreGateway, ActualLrpRepo) {
        let clock = Arc::new(FakeClock::default());
        let gateway = StoreGateway::new(Arc::new(MemoryBackend::new(clock.clone())));
        (gateway.clone(), ActualLrpRepo::new(gateway, clock))
    }

    #[tokio::test]
    async fn test_create_unclaimed_is_exclusive() {
        let (_, repo) = repo();
        let key = ActualLrpKey::new("pg", 0, "d");

        let (lrp, index) = repo.create_unclaimed(&key).await.unwrap();
        assert_eq!(lrp.state, ActualLrpState::Unclaimed);
        assert_ne!(lrp.since, 0);

        let (stored, stored_index) = repo.instance(&key).await.unwrap();
        assert_eq!(stored, lrp);
        assert_eq!(stored_index, index);

        let err = repo.create_unclaimed(&key).await.unwrap_err();
        assert!(matches!(err, BbsError::ResourceExists { .. }));
    }

    #[tokio::test]
    async fn test_groups_pair_slots_and_filter() {
        let (gateway, repo) = repo();
        let key = ActualLrpKey::new("pg", 0, "d");
        repo.create_unclaimed(&key).await.unwrap();
        repo.create_unclaimed(&ActualLrpKey::new("pg", 1, "d"))
            .await
            .unwrap();
        repo.create_unclaimed(&ActualLrpKey::new("other", 0, "e"))
            .await
            .unwrap();

        let evacuating = ActualLrp::new_running(
            key.clone(),
            ActualLrpInstanceKey::new("ig", "cell-a"),
            ActualLrpNetInfo::new("10.0.0.1", vec![]),
            1,
        );
        repo.set_evacuating(&evacuating, Duration::from_secs(60))
            .await
            .unwrap();
        gateway
            .set_with_ttl(
                &paths::actual_lrp("pg", 2, Slot::Instance),
                b"{".to_vec(),
                None,
            )
            .await
            .unwrap();

        let by_guid = repo.groups_by_process_guid("pg").await.unwrap();
        assert_eq!(by_guid.len(), 2);
        assert_eq!(by_guid[&0].evacuating.as_ref(), Some(&evacuating));
        assert!(by_guid[&1].evacuating.is_none());

        let group = repo.group("pg", 0).await.unwrap();
        let (resolved, is_evacuating) = group.resolve().unwrap();
        assert!(is_evacuating);
        assert_eq!(resolved.instance_key.cell_id, "cell-a");
        assert!(repo.group("pg", 7).await.unwrap_err().is_not_found());

        let on_cell = repo
            .groups(&ActualLrpFilter {
                cell_id: Some("cell-a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(on_cell.len(), 1);

        let in_domain = repo
            .groups(&ActualLrpFilter {
                domain: Some("e".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(in_domain.len(), 1);
    }

    #[tokio::test]
    async fn test_records_breaking_state_invariants_are_refused() {
        let (_, repo) = repo();
        let key = ActualLrpKey::new("pg", 0, "d");

        let mut claimed = ActualLrp::new_unclaimed(key.clone(), 1);
        claimed.state = ActualLrpState::Claimed;
        let err = repo.create(&claimed, Slot::Instance, None).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");
        assert!(repo.instance(&key).await.unwrap_err().is_not_found());

        let (mut lrp, index) = repo.create_unclaimed(&key).await.unwrap();
        lrp.net_info = ActualLrpNetInfo::new("10.0.0.1", vec![]);
        let err = repo.compare_and_swap(&lrp, index).await.unwrap_err();
        assert!(matches!(err, BbsError::Validation(_)));
        let (stored, stored_index) = repo.instance(&key).await.unwrap();
        assert!(stored.net_info.is_empty());
        assert_eq!(stored_index, index);

        let unplaced = ActualLrp::new_running(
            key.clone(),
            ActualLrpInstanceKey::default(),
            ActualLrpNetInfo::new("10.0.0.1", vec![]),
            1,
        );
        let err = repo
            .set_evacuating(&unplaced, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");
        assert!(repo.evacuating(&key).await.unwrap_err().is_not_found());
    }
}
