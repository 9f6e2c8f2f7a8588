// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version marker for downstream consumers.
///
/// The epoch is fixed when a record is created; the index grows with every
/// write. Concurrent writers are arbitrated by the store index, not by this
/// tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModificationTag {
    /// Random identifier chosen at creation.
    #[serde(default)]
    pub epoch: String,
    /// Write counter within the epoch.
    #[serde(default)]
    pub index: u32,
}

impl ModificationTag {
    /// A tag with a fresh epoch and index 0.
    pub fn new_epoch() -> Self {
        Self {
            epoch: Uuid::new_v4().to_string(),
            index: 0,
        }
    }

    /// Bump the index for the next write.
    pub fn increment(&mut self) {
        self.index = self.index.saturating_add(1);
    }

    /// Whether a consumer holding `self` should accept `other` as newer.
    ///
    /// Untagged records always yield to anything; a different epoch means
    /// the record was recreated.
    pub fn succeeded_by(&self, other: &ModificationTag) -> bool {
        if self.epoch.is_empty() || other.epoch.is_empty() {
            return true;
        }
        self.epoch != other.epoch || self.index < other.index
    }
}
