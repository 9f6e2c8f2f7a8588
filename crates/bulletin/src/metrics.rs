// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Convergence metrics.
//!
//! Components record through an injected [`MetricsSink`]. The production sink
//! forwards to the `metrics` facade so any installed recorder picks the values
//! up; [`InMemoryMetrics`] keeps them around for assertions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ============================================================================
// LRP convergence
// ============================================================================

/// LRP convergence runs counter.
pub const CONVERGENCE_LRP_RUNS: &str = "ConvergenceLRPRuns";

/// LRP convergence duration histogram (seconds).
pub const CONVERGENCE_LRP_DURATION: &str = "ConvergenceLRPDuration";

/// Malformed actual LRPs deleted while gathering.
pub const CONVERGENCE_LRP_PRE_PROCESSING_ACTUAL_LRPS_DELETED: &str =
    "ConvergenceLRPPreProcessingActualLRPsDeleted";

/// Malformed desired LRPs deleted while gathering.
pub const CONVERGENCE_LRP_PRE_PROCESSING_DESIRED_LRPS_DELETED: &str =
    "ConvergenceLRPPreProcessingDesiredLRPsDeleted";

/// Actual LRPs in the unclaimed state.
pub const LRPS_UNCLAIMED: &str = "LRPsUnclaimed";
/// Actual LRPs in the claimed state.
pub const LRPS_CLAIMED: &str = "LRPsClaimed";
/// Actual LRPs in the running state.
pub const LRPS_RUNNING: &str = "LRPsRunning";
/// Actual LRPs in the crashed state.
pub const LRPS_CRASHED: &str = "LRPsCrashed";
/// Sum of desired instances.
pub const LRPS_DESIRED: &str = "LRPsDesired";
/// Desired indices with no actual.
pub const LRPS_MISSING: &str = "LRPsMissing";
/// Actuals scheduled for retirement.
pub const LRPS_EXTRA: &str = "LRPsExtra";

// ============================================================================
// Task convergence
// ============================================================================

/// Task convergence runs counter.
pub const CONVERGENCE_TASK_RUNS: &str = "ConvergenceTaskRuns";

/// Task convergence duration histogram (seconds).
pub const CONVERGENCE_TASK_DURATION: &str = "ConvergenceTaskDuration";

/// Tasks deleted by convergence.
pub const CONVERGENCE_TASKS_PRUNED: &str = "ConvergenceTasksPruned";

/// Tasks re-auctioned or re-dispatched by convergence.
pub const CONVERGENCE_TASKS_KICKED: &str = "ConvergenceTasksKicked";

/// Tasks in the pending state.
pub const TASKS_PENDING: &str = "TasksPending";
/// Tasks in the running state.
pub const TASKS_RUNNING: &str = "TasksRunning";
/// Tasks in the completed state.
pub const TASKS_COMPLETED: &str = "TasksCompleted";
/// Tasks in the resolving state.
pub const TASKS_RESOLVING: &str = "TasksResolving";

/// Registers all metric descriptions with the installed recorder.
pub fn register_metrics() {
    describe_counter!(CONVERGENCE_LRP_RUNS, "Total LRP convergence runs");
    describe_histogram!(
        CONVERGENCE_LRP_DURATION,
        "Duration of LRP convergence runs in seconds"
    );
    describe_counter!(
        CONVERGENCE_LRP_PRE_PROCESSING_ACTUAL_LRPS_DELETED,
        "Malformed actual LRPs pruned during convergence"
    );
    describe_counter!(
        CONVERGENCE_LRP_PRE_PROCESSING_DESIRED_LRPS_DELETED,
        "Malformed desired LRPs pruned during convergence"
    );
    describe_gauge!(LRPS_UNCLAIMED, "Unclaimed actual LRPs");
    describe_gauge!(LRPS_CLAIMED, "Claimed actual LRPs");
    describe_gauge!(LRPS_RUNNING, "Running actual LRPs");
    describe_gauge!(LRPS_CRASHED, "Crashed actual LRPs");
    describe_gauge!(LRPS_DESIRED, "Desired LRP instances");
    describe_gauge!(LRPS_MISSING, "Desired indices without an actual LRP");
    describe_gauge!(LRPS_EXTRA, "Actual LRPs scheduled for retirement");
    describe_counter!(CONVERGENCE_TASK_RUNS, "Total task convergence runs");
    describe_histogram!(
        CONVERGENCE_TASK_DURATION,
        "Duration of task convergence runs in seconds"
    );
    describe_counter!(CONVERGENCE_TASKS_PRUNED, "Tasks deleted by convergence");
    describe_counter!(CONVERGENCE_TASKS_KICKED, "Tasks kicked by convergence");
    describe_gauge!(TASKS_PENDING, "Pending tasks");
    describe_gauge!(TASKS_RUNNING, "Running tasks");
    describe_gauge!(TASKS_COMPLETED, "Completed tasks");
    describe_gauge!(TASKS_RESOLVING, "Resolving tasks");
}

/// Destination for the values components emit.
pub trait MetricsSink: Send + Sync {
    /// Add `value` to a counter.
    fn increment_counter(&self, name: &'static str, value: u64);

    /// Record a duration sample.
    fn record_duration(&self, name: &'static str, duration: Duration);

    /// Set a gauge.
    fn set_gauge(&self, name: &'static str, value: f64);
}

/// Sink that forwards to the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn increment_counter(&self, name: &'static str, value: u64) {
        counter!(name).increment(value);
    }

    fn record_duration(&self, name: &'static str, duration: Duration) {
        histogram!(name).record(duration.as_secs_f64());
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        gauge!(name).set(value);
    }
}

/// Sink that keeps every value in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    gauges: Mutex<HashMap<&'static str, f64>>,
    durations: Mutex<HashMap<&'static str, Vec<Duration>>>,
}

impl InMemoryMetrics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters.get(name).copied().unwrap_or(0)
    }

    /// Last value a gauge was set to.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        let gauges = self.gauges.lock().unwrap_or_else(|p| p.into_inner());
        gauges.get(name).copied()
    }

    /// All recorded samples for a duration metric.
    pub fn durations(&self, name: &str) -> Vec<Duration> {
        let durations = self.durations.lock().unwrap_or_else(|p| p.into_inner());
        durations.get(name).cloned().unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, value: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        *counters.entry(name).or_default() += value;
    }

    fn record_duration(&self, name: &'static str, duration: Duration) {
        let mut durations = self.durations.lock().unwrap_or_else(|p| p.into_inner());
        durations.entry(name).or_default().push(duration);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        let mut gauges = self.gauges.lock().unwrap_or_else(|p| p.into_inner());
        gauges.insert(name, value);
    }
}
