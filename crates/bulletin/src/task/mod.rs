// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One-off tasks.
//!
//! ```text
//! PENDING ──start──► RUNNING ──complete──► COMPLETED ──resolving──► RESOLVING ──resolve──► (deleted)
//!    │                  │                      ▲
//!    └──cancel / fail───┴──────────────────────┘
//! ```

pub mod convergence;
pub mod lifecycle;

pub use convergence::{TaskConvergence, TaskConvergenceConfig, TaskConvergenceReport};
pub use lifecycle::{CompletionDispatcher, CompletionWorker, TaskLifecycle, completion_channel};
