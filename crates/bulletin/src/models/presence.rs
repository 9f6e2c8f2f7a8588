// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};

use crate::error::{BbsError, Result, ValidationError};

/// Resources a cell offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCapacity {
    /// Memory in MB.
    pub memory_mb: i32,
    /// Disk in MB.
    pub disk_mb: i32,
    /// Container slots.
    pub containers: i32,
}

/// Lease held by a live cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellPresence {
    /// Cell identifier.
    pub cell_id: String,
    /// Base URL of the cell's rep.
    pub rep_address: String,
    /// Availability zone.
    #[serde(default)]
    pub zone: String,
    /// Offered resources.
    #[serde(default)]
    pub capacity: CellCapacity,
    /// Root filesystems the cell can provide.
    #[serde(default)]
    pub rootfs_providers: Vec<String>,
    /// Free-form placement tags.
    #[serde(default)]
    pub placement_tags: Vec<String>,
}

impl CellPresence {
    /// Presence for a cell reachable at `rep_address`.
    pub fn new(cell_id: impl Into<String>, rep_address: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            rep_address: rep_address.into(),
            zone: String::new(),
            capacity: CellCapacity::default(),
            rootfs_providers: Vec::new(),
            placement_tags: Vec::new(),
        }
    }

    /// Require an id, an address and non-negative capacity.
    pub fn validate(&self) -> Result<()> {
        if self.cell_id.is_empty() {
            return Err(BbsError::NoCellId);
        }
        let mut errors = ValidationError::new();
        errors.check(self.rep_address.is_empty(), "rep_address");
        errors.check(
            self.capacity.memory_mb < 0 || self.capacity.disk_mb < 0 || self.capacity.containers < 0,
            "capacity",
        );
        errors.into_result()
    }
}

/// Lease held by the active auctioneer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctioneerPresence {
    /// Auctioneer identifier.
    pub auctioneer_id: String,
    /// Base URL auction requests go to.
    pub auctioneer_address: String,
}

/// Lease held by the active bulletin process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbsPresence {
    /// Process identifier.
    pub bbs_id: String,
    /// Advertised URL.
    pub url: String,
}

/// Lease held by a receptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceptorPresence {
    /// Receptor identifier.
    pub receptor_id: String,
    /// Base URL completion callbacks go to.
    pub receptor_url: String,
}
