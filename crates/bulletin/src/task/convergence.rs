// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic clean-up of tasks.
//!
//! | Observed | Condition | Action |
//! |----------|-----------|--------|
//! | malformed | always | delete |
//! | `PENDING` | created `expire_pending` ago | fail, "not started within time limit" |
//! | `PENDING` | updated `kick` ago | auction again |
//! | `RUNNING` | cell gone | fail, "cell disappeared before completion" |
//! | `COMPLETED` | completed `expire_completed` ago | delete |
//! | `COMPLETED` | updated `kick` ago | callback again |
//! | `RESOLVING` | completed `expire_completed` ago | delete |
//! | `RESOLVING` | updated `kick` ago | back to `COMPLETED`, callback again |

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::lifecycle::{deliver_callbacks, mark_completed, request_task_auctions};
use crate::clients::{AuctioneerClient, TaskCallbackClient};
use crate::clock::{Clock, elapsed};
use crate::config::Config;
use crate::converger::Converge;
use crate::error::Result;
use crate::metrics::{self, MetricsSink};
use crate::models::{Task, TaskState};
use crate::paths;
use crate::services::ServicesRegistry;
use crate::store::{StoreGateway, decode};
use crate::work_pool::{TASK_WORKERS, WorkPool};

/// Failure reason for tasks nobody started in time.
pub const NOT_STARTED_REASON: &str = "not started within time limit";

/// Failure reason for tasks whose cell vanished.
pub const CELL_DISAPPEARED_REASON: &str = "cell disappeared before completion";

/// Task convergence thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConvergenceConfig {
    /// Idle time after which a task is nudged again.
    pub kick_task_duration: Duration,
    /// Pending tasks older than this fail.
    pub expire_pending_task_duration: Duration,
    /// Completed tasks older than this are deleted.
    pub expire_completed_task_duration: Duration,
}

impl Default for TaskConvergenceConfig {
    fn default() -> Self {
        Self {
            kick_task_duration: Duration::from_secs(30),
            expire_pending_task_duration: Duration::from_secs(30 * 60),
            expire_completed_task_duration: Duration::from_secs(120),
        }
    }
}

impl From<&Config> for TaskConvergenceConfig {
    fn from(config: &Config) -> Self {
        Self {
            kick_task_duration: config.kick_task_duration,
            expire_pending_task_duration: config.expire_pending_task_duration,
            expire_completed_task_duration: config.expire_completed_task_duration,
        }
    }
}

/// Outcome of one task convergence run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskConvergenceReport {
    /// Store keys deleted.
    pub pruned: Vec<String>,
    /// Guids failed by convergence.
    pub failed: Vec<String>,
    /// Guids sent to the auctioneer again.
    pub auctioned: Vec<String>,
    /// Guids whose completion callback was sent.
    pub called_back: Vec<String>,
}

/// Task convergence engine.
pub struct TaskConvergence {
    gateway: StoreGateway,
    services: ServicesRegistry,
    auctioneer: Arc<dyn AuctioneerClient>,
    callbacks: Arc<dyn TaskCallbackClient>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    config: TaskConvergenceConfig,
    pool: WorkPool,
}

enum Write {
    Update {
        task: Task,
        index: u64,
        reason: &'static str,
        failing: bool,
    },
    Delete { key: String, index: u64 },
}

impl TaskConvergence {
    /// Engine with the given thresholds.
    pub fn new(
        gateway: StoreGateway,
        services: ServicesRegistry,
        auctioneer: Arc<dyn AuctioneerClient>,
        callbacks: Arc<dyn TaskCallbackClient>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        config: TaskConvergenceConfig,
    ) -> Self {
        Self {
            gateway,
            services,
            auctioneer,
            callbacks,
            clock,
            metrics,
            config,
            pool: WorkPool::new(TASK_WORKERS),
        }
    }

    /// Run once.
    pub async fn converge_tasks(&self) -> Result<TaskConvergenceReport> {
        let started = Instant::now();
        let result = self.run().await;
        self.metrics
            .increment_counter(metrics::CONVERGENCE_TASK_RUNS, 1);
        self.metrics
            .record_duration(metrics::CONVERGENCE_TASK_DURATION, started.elapsed());
        result
    }

    async fn run(&self) -> Result<TaskConvergenceReport> {
        let now = self.clock.now_nanos();
        let nodes = self.gateway.list(paths::TASK_ROOT).await?;
        let cells: BTreeSet<String> = self.services.cells().await?.into_keys().collect();

        let mut writes = Vec::new();
        let mut to_auction = Vec::new();
        let mut to_call_back = Vec::new();
        let mut counts = [0u64; 4];

        for node in nodes {
            let mut task: Task = match decode(&node) {
                Ok(task) => task,
                Err(e) => {
                    warn!(key = %node.key, error = %e, "Pruning malformed task");
                    writes.push(Write::Delete {
                        key: node.key,
                        index: node.index,
                    });
                    continue;
                }
            };

            match task.state {
                TaskState::Pending => {
                    counts[0] += 1;
                    if elapsed(now, task.created_at) >= self.config.expire_pending_task_duration {
                        mark_completed(&mut task, true, NOT_STARTED_REASON, "", now);
                        writes.push(Write::Update {
                            task,
                            index: node.index,
                            reason: NOT_STARTED_REASON,
                            failing: true,
                        });
                    } else if elapsed(now, task.updated_at) >= self.config.kick_task_duration {
                        to_auction.push(task);
                    }
                }
                TaskState::Running => {
                    counts[1] += 1;
                    if !cells.contains(&task.cell_id) {
                        mark_completed(&mut task, true, CELL_DISAPPEARED_REASON, "", now);
                        writes.push(Write::Update {
                            task,
                            index: node.index,
                            reason: CELL_DISAPPEARED_REASON,
                            failing: true,
                        });
                    }
                }
                TaskState::Completed | TaskState::Resolving => {
                    let resolving = task.state == TaskState::Resolving;
                    counts[if resolving { 3 } else { 2 }] += 1;
                    if elapsed(now, task.first_completed_at)
                        >= self.config.expire_completed_task_duration
                    {
                        writes.push(Write::Delete {
                            key: node.key,
                            index: node.index,
                        });
                    } else if elapsed(now, task.updated_at) >= self.config.kick_task_duration {
                        if resolving {
                            task.state = TaskState::Completed;
                            task.updated_at = now;
                            writes.push(Write::Update {
                                task,
                                index: node.index,
                                reason: "resolution stalled",
                                failing: false,
                            });
                        } else if task.has_callback() {
                            to_call_back.push(task);
                        }
                    }
                }
            }
        }

        let mut report = TaskConvergenceReport::default();
        let gateway = &self.gateway;
        let outcomes = self
            .pool
            .run(writes.into_iter().map(move |write| async move { apply(gateway, write).await }))
            .await;
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Applied::Deleted(key) => report.pruned.push(key),
                Applied::Updated { task, failing } => {
                    if failing {
                        report.failed.push(task.task_guid.clone());
                    }
                    if task.has_callback() {
                        to_call_back.push(task);
                    }
                }
            }
        }

        report.auctioned = to_auction.iter().map(|t| t.task_guid.clone()).collect();
        report.called_back = to_call_back.iter().map(|t| t.task_guid.clone()).collect();
        request_task_auctions(&self.services, self.auctioneer.as_ref(), &to_auction).await;
        deliver_callbacks(&self.services, self.callbacks.as_ref(), &to_call_back).await;

        self.metrics.increment_counter(
            metrics::CONVERGENCE_TASKS_PRUNED,
            report.pruned.len() as u64,
        );
        self.metrics.increment_counter(
            metrics::CONVERGENCE_TASKS_KICKED,
            (report.auctioned.len() + report.called_back.len()) as u64,
        );
        self.metrics.set_gauge(metrics::TASKS_PENDING, counts[0] as f64);
        self.metrics.set_gauge(metrics::TASKS_RUNNING, counts[1] as f64);
        self.metrics.set_gauge(metrics::TASKS_COMPLETED, counts[2] as f64);
        self.metrics.set_gauge(metrics::TASKS_RESOLVING, counts[3] as f64);

        info!(
            pruned = report.pruned.len(),
            failed = report.failed.len(),
            auctioned = report.auctioned.len(),
            called_back = report.called_back.len(),
            "Converged tasks"
        );
        Ok(report)
    }
}

enum Applied {
    Deleted(String),
    Updated { task: Task, failing: bool },
}

async fn apply(gateway: &StoreGateway, write: Write) -> Option<Applied> {
    match write {
        Write::Delete { key, index } => match gateway.compare_and_delete_by_index(&key, index).await {
            Ok(()) => Some(Applied::Deleted(key)),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete task");
                None
            }
        },
        Write::Update {
            task,
            index,
            reason,
            failing,
        } => {
            let key = paths::task(&task.task_guid);
            match gateway.compare_and_swap_json(&key, &task, index).await {
                Ok(_) => {
                    debug!(task_guid = %task.task_guid, reason, "Converged task");
                    Some(Applied::Updated { task, failing })
                }
                Err(e) => {
                    warn!(task_guid = %task.task_guid, reason, error = %e, "Failed to update task");
                    None
                }
            }
        }
    }
}

#[async_trait]
impl Converge for TaskConvergence {
    fn name(&self) -> &'static str {
        "task-convergence"
    }

    async fn converge(&self) -> Result<()> {
        self.converge_tasks().await.map(|_| ())
    }
}
