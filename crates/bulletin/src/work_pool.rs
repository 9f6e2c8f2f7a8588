// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded-concurrency fan-out.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

/// Retire actual LRPs.
pub const RETIRE_WORKERS: usize = 20;
/// Create actual LRP placeholders for a desired LRP.
pub const CREATE_WORKERS: usize = 100;
/// Resolve LRP convergence changes.
pub const CONVERGENCE_WORKERS: usize = 100;
/// Task convergence compare-and-swap batch.
pub const TASK_WORKERS: usize = 20;

/// Runs a batch of futures with at most `max_workers` in flight.
///
/// Every unit waits for a semaphore permit before it is first polled, so the
/// cap is exact.
#[derive(Debug, Clone)]
pub struct WorkPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkPool {
    /// Pool allowing `max_workers` (at least one) units at a time.
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Worker cap.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run every unit to completion, returning outputs in submission order.
    pub async fn run<I, Fut>(&self, work: I) -> Vec<Fut::Output>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future,
    {
        let gated = work.into_iter().map(|unit| {
            let permits = self.permits.clone();
            async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                unit.await
            }
        });
        join_all(gated).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_cap_is_exact() {
        let pool = WorkPool::new(3);
        let in_flight_count = AtomicUsize::new(0);
        let peak_count = AtomicUsize::new(0);
        let in_flight = &in_flight_count;
        let peak = &peak_count;

        let outputs = pool
            .run((0..20).map(move |i| async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i * 2
            }))
            .await;

        assert_eq!(peak_count.load(Ordering::SeqCst), 3);
        assert_eq!(outputs, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_zero_workers_still_progresses() {
        let pool = WorkPool::new(0);
        assert_eq!(pool.max_workers(), 1);
        let outputs = pool.run((1..=2).map(|i| async move { i })).await;
        assert_eq!(outputs, vec![1, 2]);
    }
}
