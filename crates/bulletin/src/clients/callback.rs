// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{ClientError, TaskCallbackClient, expect_status, http_client, join_url};
use crate::models::Task;

/// Receptor completion client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTaskCallbackClient {
    client: reqwest::Client,
}

impl HttpTaskCallbackClient {
    /// Client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl TaskCallbackClient for HttpTaskCallbackClient {
    async fn complete_tasks(&self, receptor_url: &str, tasks: &[Task]) -> Result<(), ClientError> {
        let url = join_url(receptor_url, "/internal/tasks/complete");
        let response = self.client.put(&url).json(tasks).send().await?;
        expect_status(&response, StatusCode::ACCEPTED)
    }
}
