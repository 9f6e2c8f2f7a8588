// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Injected time source.
//!
//! Records carry wall-clock nanoseconds (`since`, `created_at`, ...). Every
//! component reads time through a [`Clock`] so tests can pin it.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as nanoseconds since the Unix epoch.
    fn now_nanos(&self) -> i64 {
        to_nanos(self.now())
    }
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }

    /// Pin the clock to a specific instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Nanoseconds since the Unix epoch, saturating outside the representable range.
pub fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Elapsed time between two nanosecond timestamps, zero if `then` is in the future.
pub fn elapsed(now_nanos: i64, then_nanos: i64) -> Duration {
    let delta = now_nanos.saturating_sub(then_nanos);
    Duration::from_nanos(u64::try_from(delta).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_clock_advances() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
        assert_eq!(
            clock.now_nanos() - to_nanos(start),
            90 * 1_000_000_000
        );
    }

    #[test]
    fn test_elapsed_never_negative() {
        assert_eq!(elapsed(10, 20), Duration::ZERO);
        assert_eq!(elapsed(2_000_000_000, 1_000_000_000), Duration::from_secs(1));
    }
}
