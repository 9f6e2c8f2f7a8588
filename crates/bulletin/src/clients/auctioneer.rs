// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::{AuctioneerClient, ClientError, expect_status, http_client, join_url};
use crate::models::{LrpStartRequest, Task};

/// Auctioneer client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuctioneerClient {
    client: reqwest::Client,
}

impl HttpAuctioneerClient {
    /// Client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl AuctioneerClient for HttpAuctioneerClient {
    async fn request_lrp_auctions(
        &self,
        auctioneer_url: &str,
        starts: &[LrpStartRequest],
    ) -> Result<(), ClientError> {
        let url = join_url(auctioneer_url, "/v1/lrps/");
        debug!(url = %url, requests = starts.len(), "Requesting LRP auctions");
        let response = self.client.post(&url).json(starts).send().await?;
        expect_status(&response, StatusCode::CREATED)
    }

    async fn request_task_auctions(
        &self,
        auctioneer_url: &str,
        tasks: &[Task],
    ) -> Result<(), ClientError> {
        let url = join_url(auctioneer_url, "/v1/tasks/");
        debug!(url = %url, tasks = tasks.len(), "Requesting task auctions");
        let response = self.client.post(&url).json(tasks).send().await?;
        expect_status(&response, StatusCode::CREATED)
    }
}
