// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for bulletin integration tests.
//!
//! Provides TestContext: a board over an in-memory store, a fake clock,
//! recording clients, and one auctioneer and one receptor already present.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;

use bulletin::bbs::{Bbs, BbsDependencies};
use bulletin::clients::{MockAuctioneerClient, MockCellClient, MockTaskCallbackClient};
use bulletin::clock::FakeClock;
use bulletin::lrp::RestartCalculator;
use bulletin::metrics::InMemoryMetrics;
use bulletin::models::{
    ActualLrpInstanceKey, ActualLrpKey, ActualLrpNetInfo, AuctioneerPresence, CellPresence,
    DesiredLrp, PortMapping, ReceptorPresence, Task,
};
use bulletin::paths;
use bulletin::store::MemoryBackend;
use bulletin::task::{CompletionWorker, TaskConvergenceConfig};

pub const DOMAIN: &str = "cf-apps";
pub const AUCTIONEER_ADDRESS: &str = "http://auctioneer.test";
pub const RECEPTOR_URL: &str = "http://receptor.test";
pub const CALLBACK_URL: &str = "http://callbacks.test/done";

/// A board with every dependency under the test's control.
pub struct TestContext {
    pub bbs: Bbs,
    pub backend: Arc<MemoryBackend>,
    pub clock: Arc<FakeClock>,
    pub metrics: Arc<InMemoryMetrics>,
    pub auctioneer: Arc<MockAuctioneerClient>,
    pub cells: Arc<MockCellClient>,
    pub callbacks: Arc<MockTaskCallbackClient>,
    pub completion_worker: CompletionWorker,
}

impl TestContext {
    /// Create a new test context with default task thresholds.
    pub async fn new() -> Self {
        Self::with_task_config(TaskConvergenceConfig::default()).await
    }

    /// Create a new test context with the given task thresholds.
    pub async fn with_task_config(task_convergence: TaskConvergenceConfig) -> Self {
        let clock = Arc::new(FakeClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ));
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        let metrics = Arc::new(InMemoryMetrics::new());
        let auctioneer = Arc::new(MockAuctioneerClient::new());
        let cells = Arc::new(MockCellClient::new());
        let callbacks = Arc::new(MockTaskCallbackClient::new());

        let (bbs, completion_worker) = Bbs::new(BbsDependencies {
            backend: backend.clone(),
            clock: clock.clone(),
            metrics: metrics.clone(),
            auctioneer: auctioneer.clone(),
            cells: cells.clone(),
            callbacks: callbacks.clone(),
            task_convergence,
            restart: RestartCalculator::default(),
        });

        let ctx = Self {
            bbs,
            backend,
            clock,
            metrics,
            auctioneer,
            cells,
            callbacks,
            completion_worker,
        };

        ctx.bbs
            .gateway()
            .set_json_with_ttl(
                paths::AUCTIONEER_LOCK,
                &AuctioneerPresence {
                    auctioneer_id: "auctioneer-0".to_string(),
                    auctioneer_address: AUCTIONEER_ADDRESS.to_string(),
                },
                None,
            )
            .await
            .expect("Failed to register auctioneer");
        ctx.bbs
            .gateway()
            .set_json_with_ttl(
                &paths::receptor("receptor-0"),
                &ReceptorPresence {
                    receptor_id: "receptor-0".to_string(),
                    receptor_url: RECEPTOR_URL.to_string(),
                },
                None,
            )
            .await
            .expect("Failed to register receptor");

        ctx
    }

    /// Announce a cell whose rep listens on `http://<cell_id>.test`.
    pub async fn add_cell(&self, cell_id: &str) {
        let presence = CellPresence::new(cell_id, rep_address(cell_id));
        self.bbs
            .gateway()
            .set_json_with_ttl(&paths::cell(cell_id), &presence, None)
            .await
            .expect("Failed to register cell");
    }

    /// Remove a cell presence.
    pub async fn remove_cell(&self, cell_id: &str) {
        self.bbs
            .gateway()
            .delete(&paths::cell(cell_id))
            .await
            .expect("Failed to remove cell");
    }

    /// Mark the test domain fresh with no expiry.
    pub async fn fresh_domain(&self) {
        self.bbs
            .domains()
            .upsert_domain(DOMAIN, Duration::ZERO)
            .await
            .expect("Failed to upsert domain");
    }

    /// Move the fake clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

/// Rep address used for `cell_id`.
pub fn rep_address(cell_id: &str) -> String {
    format!("http://{cell_id}.test")
}

/// A valid desired LRP in the test domain.
pub fn desired_lrp(process_guid: &str, instances: i32) -> DesiredLrp {
    let mut lrp = DesiredLrp::new(
        process_guid,
        DOMAIN,
        "docker:///busybox",
        json!({"run": {"path": "/bin/sh", "args": ["-c", "sleep 3600"]}}),
    );
    lrp.instances = instances;
    lrp.ports = vec![8080];
    lrp
}

/// Key of one index of `process_guid` in the test domain.
pub fn lrp_key(process_guid: &str, index: i32) -> ActualLrpKey {
    ActualLrpKey::new(process_guid, index, DOMAIN)
}

/// Instance key for an instance on `cell_id`.
pub fn instance_key(instance_guid: &str, cell_id: &str) -> ActualLrpInstanceKey {
    ActualLrpInstanceKey::new(instance_guid, cell_id)
}

/// Net info with a single port mapping.
pub fn net_info(address: &str, host_port: u16) -> ActualLrpNetInfo {
    ActualLrpNetInfo::new(
        address,
        vec![PortMapping {
            container_port: 8080,
            host_port,
        }],
    )
}

/// A valid task in the test domain, without a callback.
pub fn task(task_guid: &str) -> Task {
    Task::new(
        task_guid,
        DOMAIN,
        "docker:///busybox",
        json!({"run": {"path": "/bin/true"}}),
    )
}

/// A valid task that asks for a completion callback.
pub fn task_with_callback(task_guid: &str) -> Task {
    let mut task = task(task_guid);
    task.completion_callback_url = Some(CALLBACK_URL.to_string());
    task
}
