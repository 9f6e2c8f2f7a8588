// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ModificationTag;
use crate::error::{BbsError, Result, ValidationError};

/// Lifecycle state of an actual LRP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActualLrpState {
    /// Waiting for placement.
    Unclaimed,
    /// A cell accepted the placement.
    Claimed,
    /// The instance is running.
    Running,
    /// The instance crashed and waits for its back-off.
    Crashed,
}

impl ActualLrpState {
    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unclaimed => "UNCLAIMED",
            Self::Claimed => "CLAIMED",
            Self::Running => "RUNNING",
            Self::Crashed => "CRASHED",
        }
    }
}

impl fmt::Display for ActualLrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an index of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActualLrpKey {
    /// Process the instance belongs to.
    pub process_guid: String,
    /// Position within the process.
    #[serde(default)]
    pub index: i32,
    /// Domain of the process.
    #[serde(default)]
    pub domain: String,
}

impl ActualLrpKey {
    /// Key for `index` of `process_guid`.
    pub fn new(process_guid: impl Into<String>, index: i32, domain: impl Into<String>) -> Self {
        Self {
            process_guid: process_guid.into(),
            index,
            domain: domain.into(),
        }
    }

    /// Require a process guid, a domain and a non-negative index. Neither
    /// name may contain `/`.
    pub fn validate(&self) -> Result<()> {
        if self.process_guid.is_empty() {
            return Err(BbsError::NoProcessGuid);
        }
        if self.domain.is_empty() {
            return Err(BbsError::NoDomain);
        }
        let mut errors = ValidationError::new();
        errors.check(self.process_guid.contains('/'), "process_guid");
        errors.check(self.domain.contains('/'), "domain");
        errors.check(self.index < 0, "index");
        errors.into_result()
    }
}

/// Which cell runs which container for an actual LRP. Empty strings mean none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActualLrpInstanceKey {
    /// Container identifier chosen by the cell.
    #[serde(default)]
    pub instance_guid: String,
    /// Cell hosting the container.
    #[serde(default)]
    pub cell_id: String,
}

impl ActualLrpInstanceKey {
    /// Instance key for a container on a cell.
    pub fn new(instance_guid: impl Into<String>, cell_id: impl Into<String>) -> Self {
        Self {
            instance_guid: instance_guid.into(),
            cell_id: cell_id.into(),
        }
    }

    /// Whether this is the empty key.
    pub fn is_empty(&self) -> bool {
        self.instance_guid.is_empty() && self.cell_id.is_empty()
    }

    /// Require both halves.
    pub fn validate(&self) -> Result<()> {
        if self.cell_id.is_empty() {
            return Err(BbsError::NoCellId);
        }
        let mut errors = ValidationError::new();
        errors.check(self.instance_guid.is_empty(), "instance_guid");
        errors.into_result()
    }
}

/// Host/container port pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the container.
    pub container_port: u16,
    /// Port on the cell.
    pub host_port: u16,
}

/// Where a running instance can be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActualLrpNetInfo {
    /// Host address.
    #[serde(default)]
    pub address: String,
    /// Port mappings.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

impl ActualLrpNetInfo {
    /// Net info for `address` with `ports`.
    pub fn new(address: impl Into<String>, ports: Vec<PortMapping>) -> Self {
        Self {
            address: address.into(),
            ports,
        }
    }

    /// Whether no address and no ports are set.
    pub fn is_empty(&self) -> bool {
        self.address.is_empty() && self.ports.is_empty()
    }
}

/// One concrete instance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualLrp {
    /// Identity.
    #[serde(flatten)]
    pub key: ActualLrpKey,
    /// Owner, empty unless claimed or running.
    #[serde(flatten)]
    pub instance_key: ActualLrpInstanceKey,
    /// Reachability, empty unless running.
    #[serde(flatten)]
    pub net_info: ActualLrpNetInfo,
    /// Crashes since the last reset.
    #[serde(default)]
    pub crash_count: i32,
    /// Reason given for the last crash.
    #[serde(default)]
    pub crash_reason: String,
    /// Lifecycle state.
    pub state: ActualLrpState,
    /// Why the auctioneer could not place the instance.
    #[serde(default)]
    pub placement_error: String,
    /// Nanosecond timestamp of the last state change.
    #[serde(default)]
    pub since: i64,
    /// Version marker.
    #[serde(default)]
    pub modification_tag: ModificationTag,
}

impl ActualLrp {
    /// Fresh unclaimed placeholder with a new tag epoch.
    pub fn new_unclaimed(key: ActualLrpKey, since: i64) -> Self {
        Self {
            key,
            instance_key: ActualLrpInstanceKey::default(),
            net_info: ActualLrpNetInfo::default(),
            crash_count: 0,
            crash_reason: String::new(),
            state: ActualLrpState::Unclaimed,
            placement_error: String::new(),
            since,
            modification_tag: ModificationTag::new_epoch(),
        }
    }

    /// Fresh running record with a new tag epoch.
    pub fn new_running(
        key: ActualLrpKey,
        instance_key: ActualLrpInstanceKey,
        net_info: ActualLrpNetInfo,
        since: i64,
    ) -> Self {
        Self {
            instance_key,
            net_info,
            state: ActualLrpState::Running,
            ..Self::new_unclaimed(key, since)
        }
    }

    /// Check the key and the per-state invariants.
    pub fn validate(&self) -> Result<()> {
        self.key.validate()?;

        let mut errors = ValidationError::new();
        match self.state {
            ActualLrpState::Unclaimed | ActualLrpState::Crashed => {
                errors.check(!self.instance_key.is_empty(), "instance_key");
                errors.check(!self.net_info.is_empty(), "net_info");
            }
            ActualLrpState::Claimed => {
                errors.check(self.instance_key.validate().is_err(), "instance_key");
                errors.check(!self.net_info.is_empty(), "net_info");
            }
            ActualLrpState::Running => {
                errors.check(self.instance_key.validate().is_err(), "instance_key");
            }
        }
        errors.check(self.since == 0, "since");
        errors.into_result()
    }
}

/// The instance and evacuating slots of one index, side by side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActualLrpGroup {
    /// Live record.
    pub instance: Option<ActualLrp>,
    /// Copy kept by a draining cell.
    pub evacuating: Option<ActualLrp>,
}

impl ActualLrpGroup {
    /// The record a consumer should act on, with a flag telling whether it
    /// came from the evacuating slot.
    ///
    /// The evacuating copy wins while the replacement instance is not yet
    /// running.
    pub fn resolve(&self) -> Option<(&ActualLrp, bool)> {
        match (&self.instance, &self.evacuating) {
            (None, None) => None,
            (Some(instance), None) => Some((instance, false)),
            (None, Some(evacuating)) => Some((evacuating, true)),
            (Some(instance), Some(evacuating)) => match instance.state {
                ActualLrpState::Running | ActualLrpState::Crashed => Some((instance, false)),
                _ => Some((evacuating, true)),
            },
        }
    }
}

/// Selects actual LRP groups in queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActualLrpFilter {
    /// Only groups of this domain.
    pub domain: Option<String>,
    /// Only groups with a slot on this cell.
    pub cell_id: Option<String>,
}

impl ActualLrpFilter {
    /// Whether `lrp` passes the filter.
    pub fn matches(&self, lrp: &ActualLrp) -> bool {
        self.domain.as_ref().is_none_or(|d| *d == lrp.key.domain)
            && self
                .cell_id
                .as_ref()
                .is_none_or(|c| *c == lrp.instance_key.cell_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running() -> ActualLrp {
        ActualLrp::new_running(
            ActualLrpKey::new("g", 0, "d"),
            ActualLrpInstanceKey::new("i-1", "cell-a"),
            ActualLrpNetInfo::new(
                "10.0.0.1",
                vec![PortMapping {
                    container_port: 8080,
                    host_port: 61000,
                }],
            ),
            1,
        )
    }

    #[test]
    fn test_flattened_wire_format() {
        let value = serde_json::to_value(running()).unwrap();
        assert_eq!(value["process_guid"], "g");
        assert_eq!(value["index"], 0);
        assert_eq!(value["cell_id"], "cell-a");
        assert_eq!(value["state"], "RUNNING");
        assert_eq!(value["ports"][0]["host_port"], 61000);
    }

    #[test]
    fn test_decode_sparse_record() {
        let lrp: ActualLrp = serde_json::from_value(json!({
            "process_guid": "g",
            "index": 4,
            "domain": "d",
            "state": "UNCLAIMED",
            "since": 7,
        }))
        .unwrap();
        assert!(lrp.instance_key.is_empty());
        assert!(lrp.net_info.is_empty());
        assert!(lrp.validate().is_ok());
    }

    #[test]
    fn test_state_invariants() {
        assert!(running().validate().is_ok());

        let mut claimed = running();
        claimed.state = ActualLrpState::Claimed;
        assert!(matches!(claimed.validate(), Err(BbsError::Validation(_))));

        let mut crashed = running();
        crashed.state = ActualLrpState::Crashed;
        crashed.net_info = ActualLrpNetInfo::default();
        assert!(crashed.validate().is_err());

        let mut unclaimed = ActualLrp::new_unclaimed(ActualLrpKey::new("g", 0, "d"), 1);
        assert!(unclaimed.validate().is_ok());
        unclaimed.key.domain.clear();
        assert_eq!(unclaimed.validate(), Err(BbsError::NoDomain));
    }

    #[test]
    fn test_group_resolution() {
        let mut replacement = ActualLrp::new_unclaimed(ActualLrpKey::new("g", 0, "d"), 2);
        let evacuating = running();
        let group = ActualLrpGroup {
            instance: Some(replacement.clone()),
            evacuating: Some(evacuating.clone()),
        };
        assert_eq!(group.resolve(), Some((&evacuating, true)));

        replacement.state = ActualLrpState::Running;
        replacement.instance_key = ActualLrpInstanceKey::new("i-2", "cell-b");
        let group = ActualLrpGroup {
            instance: Some(replacement.clone()),
            evacuating: Some(evacuating),
        };
        assert_eq!(group.resolve(), Some((&replacement, false)));
        assert_eq!(ActualLrpGroup::default().resolve(), None);
    }

    #[test]
    fn test_filter() {
        let lrp = running();
        assert!(ActualLrpFilter::default().matches(&lrp));
        assert!(
            ActualLrpFilter {
                cell_id: Some("cell-a".to_string()),
                ..Default::default()
            }
            .matches(&lrp)
        );
        assert!(
            !ActualLrpFilter {
                domain: Some("other".to_string()),
                ..Default::default()
            }
            .matches(&lrp)
        );
    }
}
