// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Presence of cooperating services.
//!
//! Cells, receptors and the auctioneer announce themselves with TTL keys.
//! [`ServicesRegistry`] reads those keys; [`PresenceHeartbeat`] keeps one
//! alive, either as a plain presence or as an exclusive lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{BbsError, Result};
use crate::models::{AuctioneerPresence, BbsPresence, CellPresence, ReceptorPresence};
use crate::paths;
use crate::store::{StoreGateway, decode};

/// Read access to service presences.
#[derive(Clone)]
pub struct ServicesRegistry {
    gateway: StoreGateway,
}

impl ServicesRegistry {
    /// Registry over `gateway`.
    pub fn new(gateway: StoreGateway) -> Self {
        Self { gateway }
    }

    /// Live cells keyed by id. Unreadable presences are skipped.
    pub async fn cells(&self) -> Result<BTreeMap<String, CellPresence>> {
        let nodes = self.gateway.list(paths::CELL_ROOT).await?;
        let mut cells = BTreeMap::new();
        for node in &nodes {
            match decode::<CellPresence>(node) {
                Ok(cell) => {
                    cells.insert(cell.cell_id.clone(), cell);
                }
                Err(e) => warn!(key = %node.key, error = %e, "Skipping unreadable cell presence"),
            }
        }
        Ok(cells)
    }

    /// Presence of one cell.
    pub async fn cell_by_id(&self, cell_id: &str) -> Result<CellPresence> {
        if cell_id.is_empty() {
            return Err(BbsError::NoCellId);
        }
        let (cell, _) = self.gateway.get_json(&paths::cell(cell_id)).await?;
        Ok(cell)
    }

    /// Address of the active auctioneer.
    pub async fn auctioneer_address(&self) -> Result<String> {
        let (presence, _): (AuctioneerPresence, u64) =
            self.gateway.get_json(paths::AUCTIONEER_LOCK).await?;
        Ok(presence.auctioneer_address)
    }

    /// Every live receptor.
    pub async fn receptors(&self) -> Result<Vec<ReceptorPresence>> {
        let nodes = self.gateway.list(paths::RECEPTOR_ROOT).await?;
        Ok(nodes
            .iter()
            .filter_map(|node| match decode(node) {
                Ok(receptor) => Some(receptor),
                Err(e) => {
                    warn!(key = %node.key, error = %e, "Skipping unreadable receptor presence");
                    None
                }
            })
            .collect())
    }

    /// URL of the process holding the bulletin lock.
    pub async fn bbs_master_url(&self) -> Result<String> {
        let (presence, _): (BbsPresence, u64) = self.gateway.get_json(paths::BBS_LOCK).await?;
        Ok(presence.url)
    }
}

/// How a heartbeat treats a key it does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    /// Overwrite: the key announces liveness only.
    Presence,
    /// Never overwrite: the key is a mutual-exclusion lease.
    Lock,
}

/// Heartbeat failures.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    /// Someone else holds the lock, or it expired before it was refreshed.
    #[error("lock lost: {key}")]
    LockLost {
        /// Lock key.
        key: String,
    },

    /// Shutdown was requested before the key was acquired.
    #[error("heartbeat shut down before acquiring {key}")]
    Cancelled {
        /// Key being acquired.
        key: String,
    },

    /// Store failure.
    #[error(transparent)]
    Store(#[from] BbsError),
}

/// Keeps one TTL key alive.
///
/// After [`acquire`](Self::acquire), [`run`](Self::run) refreshes the key every
/// `ttl / 2` by compare-and-swap, and deletes it on shutdown.
pub struct PresenceHeartbeat {
    gateway: StoreGateway,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    mode: HeartbeatMode,
    shutdown: Arc<Notify>,
}

impl PresenceHeartbeat {
    fn new<T: Serialize>(
        gateway: StoreGateway,
        key: impl Into<String>,
        value: &T,
        ttl: Duration,
        mode: HeartbeatMode,
    ) -> Result<Self> {
        Ok(Self {
            gateway,
            key: key.into(),
            value: serde_json::to_vec(value)?,
            ttl: ttl.max(Duration::from_millis(2)),
            mode,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Heartbeat announcing liveness under `key`.
    pub fn presence<T: Serialize>(
        gateway: StoreGateway,
        key: impl Into<String>,
        value: &T,
        ttl: Duration,
    ) -> Result<Self> {
        Self::new(gateway, key, value, ttl, HeartbeatMode::Presence)
    }

    /// Heartbeat holding the lock `key`.
    pub fn lock<T: Serialize>(
        gateway: StoreGateway,
        key: impl Into<String>,
        value: &T,
        ttl: Duration,
    ) -> Result<Self> {
        Self::new(gateway, key, value, ttl, HeartbeatMode::Lock)
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn refresh_interval(&self) -> Duration {
        self.ttl / 2
    }

    /// Write the key, returning its index.
    ///
    /// In lock mode this waits until the current holder's key is gone.
    pub async fn acquire(&self) -> std::result::Result<u64, HeartbeatError> {
        if self.mode == HeartbeatMode::Presence {
            let node = self
                .gateway
                .set_with_ttl(&self.key, self.value.clone(), Some(self.ttl))
                .await?;
            return Ok(node.index);
        }

        loop {
            match self
                .gateway
                .create(&self.key, self.value.clone(), Some(self.ttl))
                .await
            {
                Ok(node) => {
                    info!(key = %self.key, "Acquired lock");
                    return Ok(node.index);
                }
                Err(BbsError::ResourceExists { .. }) => {
                    debug!(key = %self.key, "Lock held elsewhere, waiting");
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Failed to acquire lock");
                }
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    return Err(HeartbeatError::Cancelled { key: self.key.clone() });
                }

                _ = tokio::time::sleep(self.refresh_interval()) => {}
            }
        }
    }

    /// Refresh the key written at `index` until shutdown or, for locks, until
    /// ownership is lost.
    pub async fn run(&self, mut index: u64) -> std::result::Result<(), HeartbeatError> {
        let mut ticker = tokio::time::interval(self.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    if let Err(e) = self.gateway.compare_and_delete_by_index(&self.key, index).await {
                        debug!(key = %self.key, error = %e, "Key not released on shutdown");
                    }
                    info!(key = %self.key, "Heartbeat stopped");
                    return Ok(());
                }

                _ = ticker.tick() => {
                    match self
                        .gateway
                        .compare_and_swap_by_index_with_ttl(&self.key, self.value.clone(), Some(self.ttl), index)
                        .await
                    {
                        Ok(node) => index = node.index,
                        Err(BbsError::IndexMismatch { .. } | BbsError::ResourceNotFound { .. })
                            if self.mode == HeartbeatMode::Lock =>
                        {
                            warn!(key = %self.key, "Lock lost");
                            return Err(HeartbeatError::LockLost { key: self.key.clone() });
                        }
                        Err(BbsError::IndexMismatch { .. } | BbsError::ResourceNotFound { .. }) => {
                            let node = self
                                .gateway
                                .set_with_ttl(&self.key, self.value.clone(), Some(self.ttl))
                                .await?;
                            index = node.index;
                        }
                        Err(e) => {
                            warn!(key = %self.key, error = %e, "Failed to refresh heartbeat");
                        }
                    }
                }
            }
        }
    }
}
