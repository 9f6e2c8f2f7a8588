// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key-value store access.
//!
//! All state lives in a hierarchical key-value store whose every write bumps a
//! global modification index. Compare-and-swap against that index is the only
//! arbitration primitive: two writers that read the same index race, and the
//! loser sees [`StoreError::IndexMismatch`].
//!
//! [`KvBackend`] abstracts the store itself:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`MemoryBackend`] | tests, single-process development |
//! | [`PostgresBackend`] | production, `kv_nodes` table |
//!
//! [`StoreGateway`] sits on top and is what the rest of the crate talks to.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::BbsError;

mod gateway;
mod memory;
mod postgres;

pub(crate) use gateway::decode;
pub use gateway::{StoreGateway, StoreWatch};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

/// Capacity of the per-backend event broadcast.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Raw store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Key does not exist.
    #[error("key not found")]
    NotFound,

    /// Key already exists.
    #[error("key already exists")]
    AlreadyExists,

    /// The modification index did not match.
    #[error("index mismatch")]
    IndexMismatch,

    /// Request timed out.
    #[error("store timeout")]
    Timeout,

    /// TTL cannot be represented.
    #[error("invalid ttl")]
    InvalidTtl,

    /// Stored bytes could not be decoded.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Backend unreachable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl StoreError {
    /// Translate into the domain taxonomy, naming the key involved.
    pub fn into_bbs(self, key: &str) -> BbsError {
        match self {
            StoreError::NotFound => BbsError::ResourceNotFound {
                key: key.to_string(),
            },
            StoreError::AlreadyExists => BbsError::ResourceExists {
                key: key.to_string(),
            },
            StoreError::IndexMismatch => BbsError::IndexMismatch {
                key: key.to_string(),
            },
            StoreError::Timeout => BbsError::Timeout,
            StoreError::InvalidTtl => BbsError::InvalidTtl,
            StoreError::InvalidFormat(reason) => BbsError::InvalidFormat { reason },
            StoreError::ServiceUnavailable(reason) => BbsError::ServiceUnavailable { reason },
        }
    }
}

/// Result type for backend operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A stored leaf (or, in delete events, a removed directory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNode {
    /// Full key.
    pub key: String,
    /// Raw value.
    pub value: Vec<u8>,
    /// Modification index of the last write.
    pub index: u64,
    /// Whether this node stands for a directory.
    pub dir: bool,
}

impl StoreNode {
    pub(crate) fn leaf(key: impl Into<String>, value: Vec<u8>, index: u64) -> Self {
        Self {
            key: key.into(),
            value,
            index,
            dir: false,
        }
    }
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    /// A key was created.
    Create,
    /// An existing key was overwritten.
    Update,
    /// A key (or directory) was deleted.
    Delete,
    /// A key reached its TTL.
    Expire,
}

/// A change observed on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Kind of change.
    pub kind: StoreEventKind,
    /// Node before the change, if any.
    pub prev: Option<StoreNode>,
    /// Node after the change, absent for deletes and expiries.
    pub node: Option<StoreNode>,
}

impl StoreEvent {
    /// Key the event is about.
    pub fn key(&self) -> &str {
        self.node
            .as_ref()
            .or(self.prev.as_ref())
            .map(|n| n.key.as_str())
            .unwrap_or_default()
    }
}

/// Storage backend.
///
/// Implementations must assign a strictly increasing index to every write
/// and must publish one [`StoreEvent`] per changed key, in index order, to
/// subscribers.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read one leaf.
    async fn get(&self, key: &str) -> StoreResult<StoreNode>;

    /// Every live leaf at or below `prefix`, sorted by key. Empty if none.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<StoreNode>>;

    /// Write a new leaf; fails if it exists.
    async fn create(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> StoreResult<StoreNode>;

    /// Write a leaf unconditionally.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> StoreResult<StoreNode>;

    /// Overwrite a leaf iff its index is still `prev_index`.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        prev_index: u64,
    ) -> StoreResult<StoreNode>;

    /// Delete a leaf iff its index is still `prev_index`.
    async fn compare_and_delete(&self, key: &str, prev_index: u64) -> StoreResult<()>;

    /// Delete a leaf.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Delete a leaf or a whole directory.
    async fn delete_tree(&self, prefix: &str) -> StoreResult<()>;

    /// Subscribe to every subsequent change.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

pub(crate) fn ttl_to_chrono(ttl: Option<Duration>) -> StoreResult<Option<chrono::Duration>> {
    ttl.map(|ttl| chrono::Duration::from_std(ttl).map_err(|_| StoreError::InvalidTtl))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_domain() {
        assert_eq!(
            StoreError::NotFound.into_bbs("/v1/task/t"),
            BbsError::ResourceNotFound {
                key: "/v1/task/t".to_string()
            }
        );
        assert_eq!(StoreError::Timeout.into_bbs("k"), BbsError::Timeout);
        assert_eq!(
            StoreError::ServiceUnavailable("refused".to_string())
                .into_bbs("k")
                .error_code(),
            "service_unavailable"
        );
    }

    #[test]
    fn test_invalid_ttl() {
        assert_eq!(
            ttl_to_chrono(Some(Duration::from_secs(u64::MAX))),
            Err(StoreError::InvalidTtl)
        );
        assert_eq!(ttl_to_chrono(None), Ok(None));
    }
}
