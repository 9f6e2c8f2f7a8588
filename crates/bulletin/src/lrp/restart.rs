// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash restart policy.

use std::time::Duration;

use crate::clock::elapsed;
use crate::models::{ActualLrp, ActualLrpState};

/// A running instance that survives this long has its crash count reset.
pub const CRASH_RESET_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Unclaimed placeholders older than this are re-auctioned.
pub const STALE_UNCLAIMED_DURATION: Duration = Duration::from_secs(30);

/// Decides when crashed instances come back.
///
/// The first `max_immediate_restarts` crashes restart at once. After that the
/// instance waits in `Crashed` for a back-off that doubles per crash, from
/// `min_backoff` up to `max_backoff`, and gives up after
/// `max_restart_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartCalculator {
    /// Crashes that restart without waiting.
    pub max_immediate_restarts: i32,
    /// Crashes after which the instance stays down.
    pub max_restart_attempts: i32,
    /// Shortest wait.
    pub min_backoff: Duration,
    /// Longest wait.
    pub max_backoff: Duration,
}

impl Default for RestartCalculator {
    fn default() -> Self {
        Self {
            max_immediate_restarts: 3,
            max_restart_attempts: 200,
            min_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(16 * 60),
        }
    }
}

impl RestartCalculator {
    /// Whether an instance with `crash_count` crashes goes straight back to
    /// `Unclaimed`.
    pub fn should_restart_immediately(&self, crash_count: i32) -> bool {
        crash_count <= self.max_immediate_restarts
    }

    /// Wait before a crashed instance with `crash_count` crashes restarts.
    pub fn backoff(&self, crash_count: i32) -> Duration {
        let doublings = crash_count
            .max(self.max_immediate_restarts)
            .saturating_sub(self.max_immediate_restarts)
            .clamp(0, 31) as u32;
        self.min_backoff
            .checked_mul(1u32 << doublings)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Whether a crashed record has waited out its back-off.
    pub fn should_restart_crash(&self, lrp: &ActualLrp, now_nanos: i64) -> bool {
        lrp.state == ActualLrpState::Crashed
            && lrp.crash_count <= self.max_restart_attempts
            && elapsed(now_nanos, lrp.since) >= self.backoff(lrp.crash_count)
    }
}
