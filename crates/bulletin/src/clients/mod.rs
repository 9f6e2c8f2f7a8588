// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound RPC to the auctioneer, cells and receptors.
//!
//! Each collaborator sits behind a trait so lifecycles and convergence can be
//! driven against the recording doubles in [`mock`]. The HTTP
//! implementations share one timeout and never retry; convergence re-issues
//! whatever was lost.
//!
//! | Client | Call | Expected status |
//! |--------|------|-----------------|
//! | Auctioneer | `POST /v1/lrps/` | 201 |
//! | Auctioneer | `POST /v1/tasks/` | 201 |
//! | Cell | `POST /v1/lrps/{process_guid}/instances/{instance_guid}/stop` | 202 |
//! | Cell | `POST /v1/tasks/{task_guid}/cancel` | 202 |
//! | Receptor | `PUT /internal/tasks/complete` | 202 |

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::BbsError;
use crate::models::{ActualLrpInstanceKey, ActualLrpKey, LrpStartRequest, Task};

mod auctioneer;
mod callback;
mod cell;
pub mod mock;

pub use auctioneer::HttpAuctioneerClient;
pub use callback::HttpTaskCallbackClient;
pub use cell::HttpCellClient;
pub use mock::{MockAuctioneerClient, MockCellClient, MockTaskCallbackClient};

/// Default timeout for every outbound call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from outbound calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Transport failure or timeout.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The peer answered with an unexpected status.
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus {
        /// Status received.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// Failure injected by a test double.
    #[error("simulated failure: {0}")]
    Simulated(String),
}

impl From<ClientError> for BbsError {
    fn from(err: ClientError) -> Self {
        BbsError::ServiceUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Placement requests.
#[async_trait]
pub trait AuctioneerClient: Send + Sync {
    /// Ask for placement of LRP indices.
    async fn request_lrp_auctions(
        &self,
        auctioneer_url: &str,
        starts: &[LrpStartRequest],
    ) -> Result<(), ClientError>;

    /// Ask for placement of tasks.
    async fn request_task_auctions(
        &self,
        auctioneer_url: &str,
        tasks: &[Task],
    ) -> Result<(), ClientError>;
}

/// Calls to a cell's rep.
#[async_trait]
pub trait CellClient: Send + Sync {
    /// Stop one LRP instance.
    async fn stop_lrp_instance(
        &self,
        rep_address: &str,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), ClientError>;

    /// Cancel a running task.
    async fn cancel_task(&self, rep_address: &str, task_guid: &str) -> Result<(), ClientError>;
}

/// Completion notifications to a receptor.
#[async_trait]
pub trait TaskCallbackClient: Send + Sync {
    /// Announce completed tasks in one call.
    async fn complete_tasks(&self, receptor_url: &str, tasks: &[Task]) -> Result<(), ClientError>;
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

pub(crate) fn expect_status(
    response: &reqwest::Response,
    expected: reqwest::StatusCode,
) -> Result<(), ClientError> {
    if response.status() == expected {
        Ok(())
    } else {
        Err(ClientError::UnexpectedStatus {
            status: response.status().as_u16(),
            url: response.url().to_string(),
        })
    }
}
