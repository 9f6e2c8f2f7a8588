// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store backend.
//!
//! Keys live in a sorted map; directories are implicit. TTLs are evaluated
//! against the injected [`Clock`], and expired keys are purged (with an
//! `Expire` event) at the start of every operation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};

use super::{
    KvBackend, StoreError, StoreEvent, StoreEventKind, StoreNode, StoreResult,
    WATCH_CHANNEL_CAPACITY, ttl_to_chrono,
};
use crate::clock::Clock;
use crate::paths;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    index: u64,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    last_index: u64,
}

impl State {
    fn next_index(&mut self) -> u64 {
        self.last_index += 1;
        self.last_index
    }

    fn node(&self, key: &str) -> Option<StoreNode> {
        self.entries
            .get(key)
            .map(|e| StoreNode::leaf(key, e.value.clone(), e.index))
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<StoreEvent> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                self.entries.remove(&key).map(|e| StoreEvent {
                    kind: StoreEventKind::Expire,
                    prev: Some(StoreNode::leaf(key, e.value, e.index)),
                    node: None,
                })
            })
            .collect()
    }
}

/// Store backend held entirely in memory.
pub struct MemoryBackend {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<StoreEvent>,
    injected_timeouts: AtomicUsize,
}

impl MemoryBackend {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            clock,
            events,
            injected_timeouts: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` operations fail with [`StoreError::Timeout`].
    pub fn inject_timeouts(&self, count: usize) {
        self.injected_timeouts.store(count, Ordering::SeqCst);
    }

    /// Index of the most recent write.
    pub async fn last_index(&self) -> u64 {
        self.state.lock().await.last_index
    }

    fn injected_fault(&self) -> StoreResult<()> {
        let took = self
            .injected_timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(StoreError::Timeout),
            Err(_) => Ok(()),
        }
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> StoreResult<Option<DateTime<Utc>>> {
        match ttl_to_chrono(ttl)? {
            Some(ttl) => now
                .checked_add_signed(ttl)
                .map(Some)
                .ok_or(StoreError::InvalidTtl),
            None => Ok(None),
        }
    }

    /// Run `op` under the lock after purging expired keys, then publish
    /// everything that happened in index order.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut State, DateTime<Utc>, &mut Vec<StoreEvent>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.injected_fault()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut events = state.purge_expired(now);
        let result = op(&mut state, now, &mut events);
        for event in events {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
        result
    }

    fn write(
        &self,
        state: &mut State,
        now: DateTime<Utc>,
        events: &mut Vec<StoreEvent>,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<StoreNode> {
        let expires_at = self.expiry(now, ttl)?;
        let prev = state.node(key);
        let index = state.next_index();
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                index,
                expires_at,
            },
        );
        let node = StoreNode::leaf(key, value, index);
        events.push(StoreEvent {
            kind: if prev.is_some() {
                StoreEventKind::Update
            } else {
                StoreEventKind::Create
            },
            prev,
            node: Some(node.clone()),
        });
        Ok(node)
    }
}

fn remove(state: &mut State, events: &mut Vec<StoreEvent>, key: &str) -> StoreResult<()> {
    let entry = state.entries.remove(key).ok_or(StoreError::NotFound)?;
    state.next_index();
    events.push(StoreEvent {
        kind: StoreEventKind::Delete,
        prev: Some(StoreNode::leaf(key, entry.value, entry.index)),
        node: None,
    });
    Ok(())
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> StoreResult<StoreNode> {
        self.mutate(|state, _, _| state.node(key).ok_or(StoreError::NotFound))
            .await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<StoreNode>> {
        self.mutate(|state, _, _| {
            Ok(state
                .entries
                .iter()
                .filter(|(k, _)| paths::is_under(k, prefix))
                .map(|(k, e)| StoreNode::leaf(k.clone(), e.value.clone(), e.index))
                .collect())
        })
        .await
    }

    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<StoreNode> {
        self.mutate(|state, now, events| {
            if state.entries.contains_key(key) {
                return Err(StoreError::AlreadyExists);
            }
            self.write(state, now, events, key, value, ttl)
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<StoreNode> {
        self.mutate(|state, now, events| self.write(state, now, events, key, value, ttl))
            .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        prev_index: u64,
    ) -> StoreResult<StoreNode> {
        self.mutate(|state, now, events| {
            let current = state.entries.get(key).ok_or(StoreError::NotFound)?;
            if current.index != prev_index {
                return Err(StoreError::IndexMismatch);
            }
            self.write(state, now, events, key, value, ttl)
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, prev_index: u64) -> StoreResult<()> {
        self.mutate(|state, _, events| {
            let current = state.entries.get(key).ok_or(StoreError::NotFound)?;
            if current.index != prev_index {
                return Err(StoreError::IndexMismatch);
            }
            remove(state, events, key)
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.mutate(|state, _, events| remove(state, events, key))
            .await
    }

    async fn delete_tree(&self, prefix: &str) -> StoreResult<()> {
        self.mutate(|state, _, events| {
            let prefix = prefix.trim_end_matches('/');
            if state.entries.contains_key(prefix) {
                return remove(state, events, prefix);
            }

            let doomed: Vec<String> = state
                .entries
                .keys()
                .filter(|k| paths::is_under(k, prefix))
                .cloned()
                .collect();
            if doomed.is_empty() {
                return Err(StoreError::NotFound);
            }
            for key in &doomed {
                state.entries.remove(key);
            }
            let index = state.next_index();
            events.push(StoreEvent {
                kind: StoreEventKind::Delete,
                prev: Some(StoreNode {
                    key: prefix.to_string(),
                    value: Vec::new(),
                    index,
                    dir: true,
                }),
                node: None,
            });
            Ok(())
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
