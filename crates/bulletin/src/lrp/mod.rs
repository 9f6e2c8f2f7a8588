// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Long-running processes: desired records, actual instances, evacuation
//! and convergence.

pub mod actual;
pub mod convergence;
pub mod desired;
pub mod evacuation;
pub mod lifecycle;
pub mod restart;

pub use actual::ActualLrpRepo;
pub use convergence::{
    ConvergenceChanges, ConvergenceInput, LrpConvergence, StoredActualLrp, calculate_convergence,
};
pub use desired::DesiredLrpStore;
pub use evacuation::Evacuator;
pub use lifecycle::LrpLifecycle;
pub use restart::RestartCalculator;
