// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recording doubles for the outbound clients.
//!
//! Every call is recorded whether or not it succeeds. A double can be told
//! to fail all calls with [`set_failing`](MockAuctioneerClient::set_failing).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AuctioneerClient, CellClient, ClientError, TaskCallbackClient};
use crate::models::{ActualLrpInstanceKey, ActualLrpKey, LrpStartRequest, Task};

fn outcome(failing: &AtomicBool, call: &str) -> Result<(), ClientError> {
    if failing.load(Ordering::SeqCst) {
        Err(ClientError::Simulated(call.to_string()))
    } else {
        Ok(())
    }
}

/// One recorded LRP auction call.
#[derive(Debug, Clone)]
pub struct LrpAuctionCall {
    /// Auctioneer address the call went to.
    pub address: String,
    /// Requests sent.
    pub starts: Vec<LrpStartRequest>,
}

/// One recorded task auction call.
#[derive(Debug, Clone)]
pub struct TaskAuctionCall {
    /// Auctioneer address the call went to.
    pub address: String,
    /// Tasks sent.
    pub tasks: Vec<Task>,
}

/// Records auction requests.
#[derive(Debug, Default)]
pub struct MockAuctioneerClient {
    lrp_calls: Mutex<Vec<LrpAuctionCall>>,
    task_calls: Mutex<Vec<TaskAuctionCall>>,
    failing: AtomicBool,
}

impl MockAuctioneerClient {
    /// Create a new mock auctioneer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Recorded LRP auction calls, oldest first.
    pub async fn lrp_calls(&self) -> Vec<LrpAuctionCall> {
        self.lrp_calls.lock().await.clone()
    }

    /// Recorded task auction calls, oldest first.
    pub async fn task_calls(&self) -> Vec<TaskAuctionCall> {
        self.task_calls.lock().await.clone()
    }

    /// Every `(process_guid, index)` requested across all calls.
    pub async fn requested_indices(&self) -> Vec<(String, i32)> {
        let calls = self.lrp_calls.lock().await;
        let mut indices: Vec<(String, i32)> = calls
            .iter()
            .flat_map(|call| call.starts.iter())
            .flat_map(|start| {
                start
                    .indices
                    .iter()
                    .map(|i| (start.desired_lrp.process_guid.clone(), *i))
            })
            .collect();
        indices.sort();
        indices
    }

    /// Forget recorded calls.
    pub async fn clear(&self) {
        self.lrp_calls.lock().await.clear();
        self.task_calls.lock().await.clear();
    }
}

#[async_trait]
impl AuctioneerClient for MockAuctioneerClient {
    async fn request_lrp_auctions(
        &self,
        auctioneer_url: &str,
        starts: &[LrpStartRequest],
    ) -> Result<(), ClientError> {
        self.lrp_calls.lock().await.push(LrpAuctionCall {
            address: auctioneer_url.to_string(),
            starts: starts.to_vec(),
        });
        outcome(&self.failing, "request_lrp_auctions")
    }

    async fn request_task_auctions(
        &self,
        auctioneer_url: &str,
        tasks: &[Task],
    ) -> Result<(), ClientError> {
        self.task_calls.lock().await.push(TaskAuctionCall {
            address: auctioneer_url.to_string(),
            tasks: tasks.to_vec(),
        });
        outcome(&self.failing, "request_task_auctions")
    }
}

/// One recorded stop call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopCall {
    /// Rep address the call went to.
    pub address: String,
    /// Instance location.
    pub key: ActualLrpKey,
    /// Instance identity.
    pub instance_key: ActualLrpInstanceKey,
}

/// Records calls to cell reps.
#[derive(Debug, Default)]
pub struct MockCellClient {
    stops: Mutex<Vec<StopCall>>,
    cancels: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl MockCellClient {
    /// Create a new mock cell client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Recorded stop calls.
    pub async fn stops(&self) -> Vec<StopCall> {
        self.stops.lock().await.clone()
    }

    /// Recorded `(rep_address, task_guid)` cancel calls.
    pub async fn cancels(&self) -> Vec<(String, String)> {
        self.cancels.lock().await.clone()
    }
}

#[async_trait]
impl CellClient for MockCellClient {
    async fn stop_lrp_instance(
        &self,
        rep_address: &str,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), ClientError> {
        self.stops.lock().await.push(StopCall {
            address: rep_address.to_string(),
            key: key.clone(),
            instance_key: instance_key.clone(),
        });
        outcome(&self.failing, "stop_lrp_instance")
    }

    async fn cancel_task(&self, rep_address: &str, task_guid: &str) -> Result<(), ClientError> {
        self.cancels
            .lock()
            .await
            .push((rep_address.to_string(), task_guid.to_string()));
        outcome(&self.failing, "cancel_task")
    }
}

/// Records completion callbacks.
#[derive(Debug, Default)]
pub struct MockTaskCallbackClient {
    calls: Mutex<Vec<(String, Vec<Task>)>>,
    failing: AtomicBool,
}

impl MockTaskCallbackClient {
    /// Create a new mock callback client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Recorded `(receptor_url, tasks)` calls.
    pub async fn calls(&self) -> Vec<(String, Vec<Task>)> {
        self.calls.lock().await.clone()
    }

    /// Guids of every task announced, in call order.
    pub async fn completed_guids(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .flat_map(|(_, tasks)| tasks.iter().map(|t| t.task_guid.clone()))
            .collect()
    }
}

#[async_trait]
impl TaskCallbackClient for MockTaskCallbackClient {
    async fn complete_tasks(&self, receptor_url: &str, tasks: &[Task]) -> Result<(), ClientError> {
        self.calls
            .lock()
            .await
            .push((receptor_url.to_string(), tasks.to_vec()));
        outcome(&self.failing, "complete_tasks")
    }
}
