// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::{CellClient, ClientError, expect_status, http_client, join_url};
use crate::models::{ActualLrpInstanceKey, ActualLrpKey};

/// Cell rep client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCellClient {
    client: reqwest::Client,
}

impl HttpCellClient {
    /// Client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl CellClient for HttpCellClient {
    async fn stop_lrp_instance(
        &self,
        rep_address: &str,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), ClientError> {
        let url = join_url(
            rep_address,
            &format!(
                "/v1/lrps/{}/instances/{}/stop",
                key.process_guid, instance_key.instance_guid
            ),
        );
        debug!(
            url = %url,
            process_guid = %key.process_guid,
            index = key.index,
            "Stopping LRP instance"
        );
        let response = self.client.post(&url).send().await?;
        expect_status(&response, StatusCode::ACCEPTED)
    }

    async fn cancel_task(&self, rep_address: &str, task_guid: &str) -> Result<(), ClientError> {
        let url = join_url(rep_address, &format!("/v1/tasks/{task_guid}/cancel"));
        debug!(url = %url, task_guid, "Cancelling task on cell");
        let response = self.client.post(&url).send().await?;
        expect_status(&response, StatusCode::ACCEPTED)
    }
}
