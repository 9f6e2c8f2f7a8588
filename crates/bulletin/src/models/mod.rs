// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stored entities and their wire representation.
//!
//! Everything serialises to snake_case JSON. States use upper-case names
//! (`UNCLAIMED`, `RUNNING`, ...).

mod actual_lrp;
mod desired_lrp;
mod modification_tag;
mod presence;
mod task;

pub use actual_lrp::*;
pub use desired_lrp::*;
pub use modification_tag::ModificationTag;
pub use presence::*;
pub use task::*;

/// Largest annotation accepted on desired LRPs and tasks.
pub const MAX_ANNOTATION_BYTES: usize = 10 * 1024;
