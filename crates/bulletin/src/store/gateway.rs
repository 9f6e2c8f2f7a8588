// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed, retrying front of a [`KvBackend`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::warn;

use super::{KvBackend, StoreEvent, StoreNode, StoreResult};
use crate::error::{BbsError, Result};
use crate::paths;

/// Pause between attempts after a store timeout.
pub const DEFAULT_TIMEOUT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Entry point to the store for every component.
///
/// Store timeouts are retried here, indefinitely; every other failure is
/// translated into a [`BbsError`] naming the key and returned.
#[derive(Clone)]
pub struct StoreGateway {
    backend: Arc<dyn KvBackend>,
    retry_interval: Duration,
}

impl StoreGateway {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            retry_interval: DEFAULT_TIMEOUT_RETRY_INTERVAL,
        }
    }

    /// Override the pause between timeout retries.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    async fn retrying<T, F, Fut>(&self, op: &'static str, key: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempts: u64 = 0;
        loop {
            match attempt().await {
                Err(super::StoreError::Timeout) => {
                    attempts += 1;
                    warn!(
                        op,
                        key,
                        attempts,
                        retry_in_ms = self.retry_interval.as_millis() as u64,
                        "Store request timed out, retrying"
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
                other => return other.map_err(|e| e.into_bbs(key)),
            }
        }
    }

    /// Read a leaf.
    pub async fn get(&self, key: &str) -> Result<StoreNode> {
        let backend = &*self.backend;
        self.retrying("get", key, move || backend.get(key)).await
    }

    /// Read and decode a leaf, returning it with its modification index.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<(T, u64)> {
        let node = self.get(key).await?;
        let value = decode(&node)?;
        Ok((value, node.index))
    }

    /// Every leaf at or below `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<StoreNode>> {
        let backend = &*self.backend;
        self.retrying("list", prefix, move || backend.list(prefix))
            .await
    }

    /// Write a new leaf; `ResourceExists` if it is already there.
    pub async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<StoreNode> {
        let backend = &*self.backend;
        self.retrying("create", key, move || backend.create(key, value.clone(), ttl))
            .await
    }

    /// Encode and create.
    pub async fn create_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<StoreNode> {
        self.create(key, encode(value)?, ttl).await
    }

    /// Write a leaf unconditionally, optionally expiring after `ttl`.
    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<StoreNode> {
        let backend = &*self.backend;
        self.retrying("set", key, move || backend.set(key, value.clone(), ttl))
            .await
    }

    /// Encode and set.
    pub async fn set_json_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<StoreNode> {
        self.set_with_ttl(key, encode(value)?, ttl).await
    }

    /// Overwrite a leaf iff it was last written at `index`.
    pub async fn compare_and_swap_by_index(
        &self,
        key: &str,
        value: Vec<u8>,
        index: u64,
    ) -> Result<StoreNode> {
        self.compare_and_swap_by_index_with_ttl(key, value, None, index)
            .await
    }

    /// Overwrite a leaf iff it was last written at `index`, resetting its TTL.
    pub async fn compare_and_swap_by_index_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        index: u64,
    ) -> Result<StoreNode> {
        let backend = &*self.backend;
        self.retrying("compare_and_swap", key, move || {
            backend.compare_and_swap(key, value.clone(), ttl, index)
        })
        .await
    }

    /// Encode and compare-and-swap.
    pub async fn compare_and_swap_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        index: u64,
    ) -> Result<StoreNode> {
        self.compare_and_swap_by_index(key, encode(value)?, index)
            .await
    }

    /// Delete a leaf iff it was last written at `index`.
    pub async fn compare_and_delete_by_index(&self, key: &str, index: u64) -> Result<()> {
        let backend = &*self.backend;
        self.retrying("compare_and_delete", key, move || {
            backend.compare_and_delete(key, index)
        })
        .await
    }

    /// Delete a leaf.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let backend = &*self.backend;
        self.retrying("delete", key, move || backend.delete(key))
            .await
    }

    /// Delete a leaf or a directory with everything below it.
    pub async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let backend = &*self.backend;
        self.retrying("delete_tree", prefix, move || backend.delete_tree(prefix))
            .await
    }

    /// Subscribe to changes at or below `prefix`.
    pub fn watch(&self, prefix: &str) -> StoreWatch {
        StoreWatch {
            prefix: prefix.to_string(),
            rx: self.backend.subscribe(),
        }
    }
}

/// Decode a leaf's JSON value.
pub(crate) fn decode<T: DeserializeOwned>(node: &StoreNode) -> Result<T> {
    serde_json::from_slice(&node.value).map_err(|e| BbsError::InvalidFormat {
        reason: format!("{}: {}", node.key, e),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Stream of raw store events below a prefix.
pub struct StoreWatch {
    prefix: String,
    rx: broadcast::Receiver<StoreEvent>,
}

impl StoreWatch {
    /// Next event below the prefix; `None` once the backend is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if paths::is_under(event.key(), &self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, "Store watch lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::store::{MemoryBackend, StoreEventKind};
    use serde_json::json;

    fn gateway() -> (Arc<MemoryBackend>, StoreGateway) {
        let backend = Arc::new(MemoryBackend::new(Arc::new(FakeClock::default())));
        let gateway = StoreGateway::new(backend.clone());
        (backend, gateway)
    }

    #[tokio::test]
    async fn test_errors_name_the_key() {
        let (_, gateway) = gateway();
        let err = gateway.get("/v1/task/missing").await.unwrap_err();
        assert_eq!(
            err,
            BbsError::ResourceNotFound {
                key: "/v1/task/missing".to_string()
            }
        );

        gateway.create("/v1/task/t", b"{}".to_vec(), None).await.unwrap();
        let err = gateway
            .create("/v1/task/t", b"{}".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "resource_exists");
    }

    #[tokio::test]
    async fn test_json_round_trip_with_index() {
        let (_, gateway) = gateway();
        let created = gateway
            .create_json("/v1/desired/g", &json!({"a": 1}), None)
            .await
            .unwrap();
        let (value, index): (serde_json::Value, u64) =
            gateway.get_json("/v1/desired/g").await.unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(index, created.index);

        let err = gateway
            .compare_and_swap_json("/v1/desired/g", &json!({"a": 2}), index + 10)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_json_is_invalid_format() {
        let (_, gateway) = gateway();
        gateway
            .create("/v1/desired/bad", b"{not json".to_vec(), None)
            .await
            .unwrap();
        let err = gateway
            .get_json::<serde_json::Value>("/v1/desired/bad")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_format");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried() {
        let (backend, gateway) = gateway();
        gateway.create("/k", b"v".to_vec(), None).await.unwrap();

        backend.inject_timeouts(3);
        let started = tokio::time::Instant::now();
        let node = gateway.get("/k").await.unwrap();

        assert_eq!(node.value, b"v");
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let (_, gateway) = gateway();
        let mut watch = gateway.watch("/v1/task");

        gateway.create("/v1/desired/g", b"{}".to_vec(), None).await.unwrap();
        gateway.create("/v1/task/t", b"{}".to_vec(), None).await.unwrap();

        let event = watch.next().await.unwrap();
        assert_eq!(event.kind, StoreEventKind::Create);
        assert_eq!(event.key(), "/v1/task/t");
    }
}
