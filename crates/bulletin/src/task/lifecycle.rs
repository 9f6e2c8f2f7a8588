// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task state machine and completion callbacks.

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::clients::{AuctioneerClient, CellClient, TaskCallbackClient};
use crate::clock::Clock;
use crate::error::{BbsError, Result, Transition};
use crate::models::{Task, TaskFilter, TaskState};
use crate::paths;
use crate::services::ServicesRegistry;
use crate::store::{StoreGateway, decode};

/// Failure reason recorded on cancelled tasks.
pub const CANCELLED_REASON: &str = "task was cancelled";

/// Most tasks sent in one callback.
pub const MAX_CALLBACK_BATCH: usize = 100;

/// Applies task transitions.
#[derive(Clone)]
pub struct TaskLifecycle {
    gateway: StoreGateway,
    services: ServicesRegistry,
    auctioneer: Arc<dyn AuctioneerClient>,
    cells: Arc<dyn CellClient>,
    clock: Arc<dyn Clock>,
    callbacks: CompletionDispatcher,
}

impl TaskLifecycle {
    /// Lifecycle writing through `gateway` and announcing completions on
    /// `callbacks`.
    pub fn new(
        gateway: StoreGateway,
        services: ServicesRegistry,
        auctioneer: Arc<dyn AuctioneerClient>,
        cells: Arc<dyn CellClient>,
        clock: Arc<dyn Clock>,
        callbacks: CompletionDispatcher,
    ) -> Self {
        Self {
            gateway,
            services,
            auctioneer,
            cells,
            clock,
            callbacks,
        }
    }

    async fn read(&self, task_guid: &str) -> Result<(Task, u64)> {
        match self.gateway.get_json(&paths::task(task_guid)).await {
            Err(e) if e.is_not_found() => Err(BbsError::TaskNotFound {
                task_guid: task_guid.to_string(),
            }),
            other => other,
        }
    }

    async fn write(&self, task: &Task, index: u64) -> Result<()> {
        self.gateway
            .compare_and_swap_json(&paths::task(&task.task_guid), task, index)
            .await?;
        Ok(())
    }

    /// Persist a new pending task and ask for its placement.
    ///
    /// The auction request is best effort; once the task is stored,
    /// convergence keeps kicking it.
    pub async fn desire_task(&self, mut task: Task) -> Result<()> {
        task.validate()?;

        let now = self.clock.now_nanos();
        task.state = TaskState::Pending;
        task.cell_id.clear();
        task.failed = false;
        task.failure_reason.clear();
        task.result.clear();
        task.created_at = now;
        task.updated_at = now;
        task.first_completed_at = 0;

        self.gateway
            .create_json(&paths::task(&task.task_guid), &task, None)
            .await?;
        info!(task_guid = %task.task_guid, domain = %task.domain, "Desired task");

        request_task_auctions(&self.services, self.auctioneer.as_ref(), &[task]).await;
        Ok(())
    }

    /// Move a pending task onto `cell_id`.
    ///
    /// Returns `false` when the task was already running there.
    pub async fn start_task(&self, task_guid: &str, cell_id: &str) -> Result<bool> {
        if cell_id.is_empty() {
            return Err(BbsError::NoCellId);
        }

        let (mut task, index) = self.read(task_guid).await?;
        match task.state {
            TaskState::Pending => {}
            TaskState::Running if task.cell_id == cell_id => return Ok(false),
            TaskState::Running => {
                return Err(BbsError::TaskRunningOnDifferentCell {
                    task_guid: task_guid.to_string(),
                    cell_id: task.cell_id,
                });
            }
            from => {
                return Err(BbsError::InvalidStateTransition {
                    from,
                    to: TaskState::Running,
                });
            }
        }

        task.state = TaskState::Running;
        task.cell_id = cell_id.to_string();
        task.updated_at = self.clock.now_nanos();
        self.write(&task, index).await?;

        info!(task_guid, cell_id, "Started task");
        Ok(true)
    }

    /// Stop a task that has not completed, asking its cell to kill it.
    pub async fn cancel_task(&self, task_guid: &str) -> Result<()> {
        let (mut task, index) = self.read(task_guid).await?;
        let from = task.state;
        if !matches!(from, TaskState::Pending | TaskState::Running) {
            return Err(BbsError::TaskCannotBe {
                transition: Transition::Cancelled,
                state: from,
            });
        }

        mark_completed(&mut task, true, CANCELLED_REASON, "", self.clock.now_nanos());
        self.write(&task, index).await?;
        info!(task_guid, from = %from, "Cancelled task");

        if from == TaskState::Running {
            self.cancel_on_cell(&task).await;
        }
        self.callbacks.enqueue(&task);
        Ok(())
    }

    async fn cancel_on_cell(&self, task: &Task) {
        let cell = match self.services.cell_by_id(&task.cell_id).await {
            Ok(cell) => cell,
            Err(e) => {
                debug!(task_guid = %task.task_guid, cell_id = %task.cell_id, error = %e, "Cell not found for cancel");
                return;
            }
        };
        if let Err(e) = self
            .cells
            .cancel_task(&cell.rep_address, &task.task_guid)
            .await
        {
            warn!(task_guid = %task.task_guid, cell_id = %task.cell_id, error = %e, "Failed to cancel task on cell");
        }
    }

    /// Complete a task that has not completed as failed.
    pub async fn fail_task(&self, task_guid: &str, reason: &str) -> Result<()> {
        let (mut task, index) = self.read(task_guid).await?;
        let from = task.state;
        if !matches!(from, TaskState::Pending | TaskState::Running) {
            return Err(BbsError::InvalidStateTransition {
                from,
                to: TaskState::Completed,
            });
        }

        mark_completed(&mut task, true, reason, "", self.clock.now_nanos());
        self.write(&task, index).await?;
        warn!(task_guid, from = %from, reason, "Failed task");

        self.callbacks.enqueue(&task);
        Ok(())
    }

    /// Record the outcome reported by the cell running the task.
    pub async fn complete_task(
        &self,
        task_guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
        result: &str,
    ) -> Result<()> {
        let (mut task, index) = self.read(task_guid).await?;
        match task.state {
            TaskState::Running if task.cell_id == cell_id => {}
            TaskState::Running => {
                return Err(BbsError::TaskRunningOnDifferentCell {
                    task_guid: task_guid.to_string(),
                    cell_id: task.cell_id,
                });
            }
            from => {
                return Err(BbsError::InvalidStateTransition {
                    from,
                    to: TaskState::Completed,
                });
            }
        }

        mark_completed(&mut task, failed, failure_reason, result, self.clock.now_nanos());
        self.write(&task, index).await?;
        info!(task_guid, cell_id, failed, "Completed task");

        self.callbacks.enqueue(&task);
        Ok(())
    }

    /// Claim a completed task for resolution.
    pub async fn resolving_task(&self, task_guid: &str) -> Result<()> {
        let (mut task, index) = self.read(task_guid).await?;
        if task.state != TaskState::Completed {
            return Err(BbsError::TaskCannotBe {
                transition: Transition::MarkedResolving,
                state: task.state,
            });
        }

        task.state = TaskState::Resolving;
        task.updated_at = self.clock.now_nanos();
        self.write(&task, index).await?;
        debug!(task_guid, "Resolving task");
        Ok(())
    }

    /// Delete a task being resolved.
    pub async fn resolve_task(&self, task_guid: &str) -> Result<()> {
        let (task, index) = self.read(task_guid).await?;
        if task.state != TaskState::Resolving {
            return Err(BbsError::TaskCannotBe {
                transition: Transition::Resolved,
                state: task.state,
            });
        }

        self.gateway
            .compare_and_delete_by_index(&paths::task(task_guid), index)
            .await?;
        info!(task_guid, "Resolved task");
        Ok(())
    }

    /// Tasks passing `filter`. Unreadable records are skipped.
    pub async fn tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let nodes = self.gateway.list(paths::TASK_ROOT).await?;
        Ok(nodes
            .iter()
            .filter_map(|node| match decode::<Task>(node) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(key = %node.key, error = %e, "Skipping unreadable task");
                    None
                }
            })
            .filter(|task| filter.matches(task))
            .collect())
    }

    /// One task.
    pub async fn task_by_guid(&self, task_guid: &str) -> Result<Task> {
        self.read(task_guid).await.map(|(task, _)| task)
    }
}

/// Move `task` to `Completed` at `now`.
pub(crate) fn mark_completed(task: &mut Task, failed: bool, reason: &str, result: &str, now: i64) {
    task.state = TaskState::Completed;
    task.failed = failed;
    task.failure_reason = reason.to_string();
    task.result = result.to_string();
    task.first_completed_at = now;
    task.updated_at = now;
}

/// Ask the auctioneer to place `tasks`. Best effort.
pub(crate) async fn request_task_auctions(
    services: &ServicesRegistry,
    auctioneer: &dyn AuctioneerClient,
    tasks: &[Task],
) {
    if tasks.is_empty() {
        return;
    }
    let address = match services.auctioneer_address().await {
        Ok(address) => address,
        Err(e) => {
            warn!(error = %e, tasks = tasks.len(), "No auctioneer, skipping task auctions");
            return;
        }
    };
    if let Err(e) = auctioneer.request_task_auctions(&address, tasks).await {
        warn!(error = %e, tasks = tasks.len(), "Failed to request task auctions");
    }
}

/// Announce completed tasks to a receptor in one call. Best effort.
pub(crate) async fn deliver_callbacks(
    services: &ServicesRegistry,
    client: &dyn TaskCallbackClient,
    tasks: &[Task],
) {
    if tasks.is_empty() {
        return;
    }
    let receptor = match services.receptors().await {
        Ok(receptors) => receptors.into_iter().next(),
        Err(e) => {
            warn!(error = %e, "Failed to look up receptors");
            return;
        }
    };
    let Some(receptor) = receptor else {
        warn!(tasks = tasks.len(), "No receptor, dropping completion callbacks");
        return;
    };
    match client.complete_tasks(&receptor.receptor_url, tasks).await {
        Ok(()) => debug!(tasks = tasks.len(), receptor = %receptor.receptor_id, "Delivered completion callbacks"),
        Err(e) => warn!(error = %e, tasks = tasks.len(), "Failed to deliver completion callbacks"),
    }
}

/// Queue of completed tasks waiting for their callback.
#[derive(Clone)]
pub struct CompletionDispatcher {
    tx: mpsc::UnboundedSender<Task>,
}

impl CompletionDispatcher {
    /// Queue `task` if it asked for a callback.
    pub fn enqueue(&self, task: &Task) {
        if !task.has_callback() {
            return;
        }
        if self.tx.send(task.clone()).is_err() {
            warn!(task_guid = %task.task_guid, "Completion worker gone, dropping callback");
        }
    }
}

/// Drains the completion queue into batched callbacks.
pub struct CompletionWorker {
    rx: mpsc::UnboundedReceiver<Task>,
    services: ServicesRegistry,
    client: Arc<dyn TaskCallbackClient>,
    shutdown: Arc<Notify>,
}

/// A dispatcher and the worker serving it.
pub fn completion_channel(
    services: ServicesRegistry,
    client: Arc<dyn TaskCallbackClient>,
) -> (CompletionDispatcher, CompletionWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CompletionDispatcher { tx },
        CompletionWorker {
            rx,
            services,
            client,
            shutdown: Arc::new(Notify::new()),
        },
    )
}

impl CompletionWorker {
    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Deliver callbacks until shutdown or until every dispatcher is gone.
    pub async fn run(mut self) {
        info!("Completion worker started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    let flushed = self.flush().await;
                    info!(flushed, "Completion worker shutting down");
                    break;
                }

                task = self.rx.recv() => {
                    let Some(task) = task else {
                        info!("Completion queue closed");
                        break;
                    };
                    let mut batch = vec![task];
                    while batch.len() < MAX_CALLBACK_BATCH {
                        match self.rx.try_recv() {
                            Ok(task) => batch.push(task),
                            Err(_) => break,
                        }
                    }
                    deliver_callbacks(&self.services, self.client.as_ref(), &batch).await;
                }
            }
        }
    }

    /// Deliver whatever is queued right now, returning how many tasks were sent.
    pub async fn flush(&mut self) -> usize {
        let mut sent = 0;
        loop {
            let mut batch = Vec::new();
            while batch.len() < MAX_CALLBACK_BATCH {
                match self.rx.try_recv() {
                    Ok(task) => batch.push(task),
                    Err(_) => break,
                }
            }
            if batch.is_empty() {
                return sent;
            }
            sent += batch.len();
            deliver_callbacks(&self.services, self.client.as_ref(), &batch).await;
        }
    }
}
