// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key schema.
//!
//! ```text
//! /v1/desired/<process-guid>
//! /v1/actual/<process-guid>/<index>/instance
//! /v1/actual/<process-guid>/<index>/evacuating
//! /v1/task/<task-guid>
//! /v1/domain/<domain>
//! /v1/cell/<cell-id>
//! /v1/locks/auctioneer_lock
//! /v1/locks/bbs_lock
//! /v1/receptor/<receptor-id>
//! ```

/// Root of desired LRPs.
pub const DESIRED_LRP_ROOT: &str = "/v1/desired";
/// Root of actual LRPs.
pub const ACTUAL_LRP_ROOT: &str = "/v1/actual";
/// Root of tasks.
pub const TASK_ROOT: &str = "/v1/task";
/// Root of fresh domains.
pub const DOMAIN_ROOT: &str = "/v1/domain";
/// Root of cell presences.
pub const CELL_ROOT: &str = "/v1/cell";
/// Root of locks.
pub const LOCK_ROOT: &str = "/v1/locks";
/// Root of receptor presences.
pub const RECEPTOR_ROOT: &str = "/v1/receptor";
/// Auctioneer leader lock.
pub const AUCTIONEER_LOCK: &str = "/v1/locks/auctioneer_lock";
/// Bulletin leader lock.
pub const BBS_LOCK: &str = "/v1/locks/bbs_lock";

/// Which of the two mirror trees an actual LRP lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The live record.
    Instance,
    /// The copy kept alive by a draining cell.
    Evacuating,
}

impl Slot {
    /// Leaf name of the slot.
    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Instance => "instance",
            Slot::Evacuating => "evacuating",
        }
    }
}

/// Key of a desired LRP.
pub fn desired_lrp(process_guid: &str) -> String {
    format!("{DESIRED_LRP_ROOT}/{process_guid}")
}

/// Directory holding every index of a process.
pub fn actual_lrp_process_dir(process_guid: &str) -> String {
    format!("{ACTUAL_LRP_ROOT}/{process_guid}")
}

/// Directory holding both slots of one index.
pub fn actual_lrp_index_dir(process_guid: &str, index: i32) -> String {
    format!("{ACTUAL_LRP_ROOT}/{process_guid}/{index}")
}

/// Key of one actual LRP slot.
pub fn actual_lrp(process_guid: &str, index: i32, slot: Slot) -> String {
    format!("{ACTUAL_LRP_ROOT}/{process_guid}/{index}/{}", slot.as_str())
}

/// Key of a task.
pub fn task(task_guid: &str) -> String {
    format!("{TASK_ROOT}/{task_guid}")
}

/// Key of a domain freshness marker.
pub fn domain(domain: &str) -> String {
    format!("{DOMAIN_ROOT}/{domain}")
}

/// Key of a cell presence.
pub fn cell(cell_id: &str) -> String {
    format!("{CELL_ROOT}/{cell_id}")
}

/// Key of a receptor presence.
pub fn receptor(receptor_id: &str) -> String {
    format!("{RECEPTOR_ROOT}/{receptor_id}")
}

/// Last segment of a key.
pub fn leaf_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Split an actual LRP leaf key into `(process_guid, index, slot)`.
pub fn parse_actual_lrp(key: &str) -> Option<(&str, i32, Slot)> {
    let rest = key.strip_prefix(ACTUAL_LRP_ROOT)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let process_guid = parts.next().filter(|g| !g.is_empty())?;
    let index = parts.next()?.parse().ok()?;
    let slot = match parts.next()? {
        "instance" => Slot::Instance,
        "evacuating" => Slot::Evacuating,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((process_guid, index, slot))
}

/// Whether `key` equals `prefix` or lies below it.
pub fn is_under(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
