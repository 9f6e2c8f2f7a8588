// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store backend.
//!
//! Every key is a row of `kv_nodes`; `mod_index` is drawn from the
//! `kv_mod_index_seq` sequence so it grows across the whole table. Expired
//! rows are invisible to reads and are deleted (emitting `Expire` events)
//! before each create. Watch events are published in-process once the
//! writing transaction has committed, so only writes made through this
//! backend instance are observed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    KvBackend, StoreError, StoreEvent, StoreEventKind, StoreNode, StoreResult,
    WATCH_CHANNEL_CAPACITY, ttl_to_chrono,
};
use crate::clock::Clock;

#[derive(Debug, sqlx::FromRow)]
struct KvRow {
    key: String,
    value: Vec<u8>,
    mod_index: i64,
}

impl KvRow {
    fn into_node(self) -> StoreNode {
        StoreNode::leaf(self.key, self.value, u64::try_from(self.mod_index).unwrap_or(0))
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        other => StoreError::ServiceUnavailable(other.to_string()),
    }
}

/// Store backend on a PostgreSQL `kv_nodes` table.
pub struct PostgresBackend {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<StoreEvent>,
}

impl PostgresBackend {
    /// Wrap a pool whose database has the bulletin migrations applied.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            pool,
            clock,
            events,
        }
    }

    fn expires_at(&self, ttl: Option<Duration>) -> StoreResult<Option<DateTime<Utc>>> {
        match ttl_to_chrono(ttl)? {
            Some(ttl) => self
                .clock
                .now()
                .checked_add_signed(ttl)
                .map(Some)
                .ok_or(StoreError::InvalidTtl),
            None => Ok(None),
        }
    }

    fn publish(&self, events: Vec<StoreEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    /// Delete every expired row, returning one `Expire` event per row.
    async fn purge_expired(
        &self,
        tx: &mut Transaction<'static, Postgres>,
    ) -> StoreResult<Vec<StoreEvent>> {
        let rows = sqlx::query_as::<_, KvRow>(
            r#"
            DELETE FROM kv_nodes
            WHERE expires_at IS NOT NULL AND expires_at <= $1
            RETURNING key, value, mod_index
            "#,
        )
        .bind(self.clock.now())
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        if !rows.is_empty() {
            debug!(count = rows.len(), "Purged expired keys");
        }

        Ok(rows
            .into_iter()
            .map(|row| StoreEvent {
                kind: StoreEventKind::Expire,
                prev: Some(row.into_node()),
                node: None,
            })
            .collect())
    }

    async fn lock_live(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &str,
    ) -> StoreResult<Option<KvRow>> {
        sqlx::query_as::<_, KvRow>(
            r#"
            SELECT key, value, mod_index
            FROM kv_nodes
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2)
            FOR UPDATE
            "#,
        )
        .bind(key)
        .bind(self.clock.now())
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx)
    }

    async fn upsert(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &str,
        value: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<StoreNode> {
        let row = sqlx::query_as::<_, KvRow>(
            r#"
            INSERT INTO kv_nodes (key, value, mod_index, expires_at)
            VALUES ($1, $2, nextval('kv_mod_index_seq'), $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                mod_index = EXCLUDED.mod_index,
                expires_at = EXCLUDED.expires_at
            RETURNING key, value, mod_index
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        Ok(row.into_node())
    }

    async fn delete_row(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &str,
    ) -> StoreResult<()> {
        sqlx::query("DELETE FROM kv_nodes WHERE key = $1")
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

fn write_event(prev: Option<StoreNode>, node: StoreNode) -> StoreEvent {
    StoreEvent {
        kind: if prev.is_some() {
            StoreEventKind::Update
        } else {
            StoreEventKind::Create
        },
        prev,
        node: Some(node),
    }
}

fn delete_event(prev: StoreNode) -> StoreEvent {
    StoreEvent {
        kind: StoreEventKind::Delete,
        prev: Some(prev),
        node: None,
    }
}

#[async_trait]
impl KvBackend for PostgresBackend {
    async fn get(&self, key: &str) -> StoreResult<StoreNode> {
        let row = sqlx::query_as::<_, KvRow>(
            r#"
            SELECT key, value, mod_index
            FROM kv_nodes
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(key)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.map(KvRow::into_node).ok_or(StoreError::NotFound)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<StoreNode>> {
        let prefix = prefix.trim_end_matches('/');
        let rows = sqlx::query_as::<_, KvRow>(
            r#"
            SELECT key, value, mod_index
            FROM kv_nodes
            WHERE (key = $1 OR left(key, length($2)) = $2)
              AND (expires_at IS NULL OR expires_at > $3)
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .bind(format!("{prefix}/"))
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows.into_iter().map(KvRow::into_node).collect())
    }

    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<StoreNode> {
        let expires_at = self.expires_at(ttl)?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let mut events = self.purge_expired(&mut tx).await?;

        let row = sqlx::query_as::<_, KvRow>(
            r#"
            INSERT INTO kv_nodes (key, value, mod_index, expires_at)
            VALUES ($1, $2, nextval('kv_mod_index_seq'), $3)
            ON CONFLICT (key) DO NOTHING
            RETURNING key, value, mod_index
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            tx.commit().await.map_err(map_sqlx)?;
            self.publish(events);
            return Err(StoreError::AlreadyExists);
        };

        tx.commit().await.map_err(map_sqlx)?;
        let node = row.into_node();
        events.push(write_event(None, node.clone()));
        self.publish(events);
        Ok(node)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<StoreNode> {
        let expires_at = self.expires_at(ttl)?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let prev = self.lock_live(&mut tx, key).await?.map(KvRow::into_node);
        let node = self.upsert(&mut tx, key, &value, expires_at).await?;
        tx.commit().await.map_err(map_sqlx)?;

        self.publish(vec![write_event(prev, node.clone())]);
        Ok(node)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        prev_index: u64,
    ) -> StoreResult<StoreNode> {
        let expires_at = self.expires_at(ttl)?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let current = self
            .lock_live(&mut tx, key)
            .await?
            .ok_or(StoreError::NotFound)?
            .into_node();
        if current.index != prev_index {
            return Err(StoreError::IndexMismatch);
        }
        let node = self.upsert(&mut tx, key, &value, expires_at).await?;
        tx.commit().await.map_err(map_sqlx)?;

        self.publish(vec![write_event(Some(current), node.clone())]);
        Ok(node)
    }

    async fn compare_and_delete(&self, key: &str, prev_index: u64) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let current = self
            .lock_live(&mut tx, key)
            .await?
            .ok_or(StoreError::NotFound)?
            .into_node();
        if current.index != prev_index {
            return Err(StoreError::IndexMismatch);
        }
        self.delete_row(&mut tx, key).await?;
        tx.commit().await.map_err(map_sqlx)?;

        self.publish(vec![delete_event(current)]);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let current = self
            .lock_live(&mut tx, key)
            .await?
            .ok_or(StoreError::NotFound)?
            .into_node();
        self.delete_row(&mut tx, key).await?;
        tx.commit().await.map_err(map_sqlx)?;

        self.publish(vec![delete_event(current)]);
        Ok(())
    }

    async fn delete_tree(&self, prefix: &str) -> StoreResult<()> {
        let prefix = prefix.trim_end_matches('/');
        let rows = sqlx::query_as::<_, KvRow>(
            r#"
            DELETE FROM kv_nodes
            WHERE key = $1 OR left(key, length($2)) = $2
            RETURNING key, value, mod_index
            "#,
        )
        .bind(prefix)
        .bind(format!("{prefix}/"))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut rows = rows.into_iter();
        let event = match (rows.next(), rows.next()) {
            (None, _) => return Err(StoreError::NotFound),
            (Some(row), None) if row.key == prefix => delete_event(row.into_node()),
            (Some(first), _) => delete_event(StoreNode {
                key: prefix.to_string(),
                value: Vec::new(),
                index: u64::try_from(first.mod_index).unwrap_or(0),
                dir: true,
            }),
        };
        self.publish(vec![event]);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
