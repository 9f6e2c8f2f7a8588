// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed change streams over the store.
//!
//! Each watch subscribes before returning, so every write made after the
//! call is observed. Directory deletes and values that fail to decode are
//! dropped.

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{ActualLrp, DesiredLrp, Task};
use crate::paths::{self, Slot};
use crate::store::{StoreEvent, StoreEventKind, StoreGateway, StoreNode, WATCH_CHANNEL_CAPACITY, decode};

/// One change to a watched record.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    /// A record appeared.
    Created(T),
    /// A record was overwritten.
    Changed {
        /// Value before the write.
        before: T,
        /// Value after the write.
        after: T,
    },
    /// A record was deleted or expired.
    Removed(T),
}

/// An actual LRP together with the slot it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedActualLrp {
    /// The record.
    pub lrp: ActualLrp,
    /// Whether it lives in the evacuating slot.
    pub evacuating: bool,
}

/// Receiving end of a watch.
///
/// Dropping the stream stops the watch.
pub struct EventStream<T> {
    rx: mpsc::Receiver<WatchEvent<T>>,
    cancel: CancellationToken,
}

impl<T> EventStream<T> {
    /// Next event, or `None` once the watch has stopped.
    pub async fn next(&mut self) -> Option<WatchEvent<T>> {
        self.rx.recv().await
    }

    /// Stop the watch. Events already queued can still be read.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token that stops the watch when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Watch every desired LRP.
pub fn watch_desired_lrps(gateway: &StoreGateway) -> EventStream<DesiredLrp> {
    spawn_watch(gateway, paths::DESIRED_LRP_ROOT, decode_node::<DesiredLrp>)
}

/// Watch both slots of every actual LRP.
pub fn watch_actual_lrps(gateway: &StoreGateway) -> EventStream<WatchedActualLrp> {
    spawn_watch(gateway, paths::ACTUAL_LRP_ROOT, |node| {
        let (_, _, slot) = paths::parse_actual_lrp(&node.key)?;
        let lrp = decode_node::<ActualLrp>(node)?;
        Some(WatchedActualLrp {
            lrp,
            evacuating: slot == Slot::Evacuating,
        })
    })
}

/// Watch every task.
pub fn watch_tasks(gateway: &StoreGateway) -> EventStream<Task> {
    spawn_watch(gateway, paths::TASK_ROOT, decode_node::<Task>)
}

fn decode_node<T: DeserializeOwned>(node: &StoreNode) -> Option<T> {
    match decode(node) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %node.key, error = %e, "Dropping undecodable watch event");
            None
        }
    }
}

fn spawn_watch<T, F>(gateway: &StoreGateway, prefix: &'static str, parse: F) -> EventStream<T>
where
    T: Send + 'static,
    F: Fn(&StoreNode) -> Option<T> + Send + 'static,
{
    let mut watch = gateway.watch(prefix);
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = watch.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(event) = translate(&event, &parse) else {
                continue;
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                sent = tx.send(event) => if sent.is_err() { break },
            }
        }
        debug!(prefix, "Watch stopped");
    });

    EventStream { rx, cancel }
}

fn translate<T, F>(event: &StoreEvent, parse: &F) -> Option<WatchEvent<T>>
where
    F: Fn(&StoreNode) -> Option<T>,
{
    let leaf = |node: &Option<StoreNode>| node.as_ref().filter(|n| !n.dir).and_then(parse);

    match event.kind {
        StoreEventKind::Create => leaf(&event.node).map(WatchEvent::Created),
        StoreEventKind::Update => {
            let after = leaf(&event.node)?;
            match leaf(&event.prev) {
                Some(before) => Some(WatchEvent::Changed { before, after }),
                None => Some(WatchEvent::Created(after)),
            }
        }
        StoreEventKind::Delete | StoreEventKind::Expire => {
            leaf(&event.prev).map(WatchEvent::Removed)
        }
    }
}
