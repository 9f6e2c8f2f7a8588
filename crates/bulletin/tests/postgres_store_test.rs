// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store backend tests.
//!
//! These run against a real database and are skipped unless
//! TEST_BULLETIN_DATABASE_URL (or BULLETIN_DATABASE_URL) is set. Each test
//! works under its own random key prefix.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use bulletin::clock::FakeClock;
use bulletin::error::BbsError;
use bulletin::migrations;
use bulletin::store::{PostgresBackend, StoreEventKind, StoreGateway};

/// Skip test if database URL is not set
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_BULLETIN_DATABASE_URL").is_err()
            && std::env::var("BULLETIN_DATABASE_URL").is_err()
        {
            eprintln!("Skipping test: TEST_BULLETIN_DATABASE_URL or BULLETIN_DATABASE_URL not set");
            return;
        }
    };
}

async fn get_pool() -> Option<sqlx::PgPool> {
    let database_url = std::env::var("TEST_BULLETIN_DATABASE_URL")
        .or_else(|_| std::env::var("BULLETIN_DATABASE_URL"))
        .ok()?;
    let pool = sqlx::PgPool::connect(&database_url).await.ok()?;
    migrations::run(&pool).await.ok()?;
    Some(pool)
}

async fn gateway() -> Option<(StoreGateway, Arc<FakeClock>, String)> {
    let pool = get_pool().await?;
    let clock = Arc::new(FakeClock::new(Utc::now()));
    let backend = Arc::new(PostgresBackend::new(pool, clock.clone()));
    let prefix = format!("/test/{}", Uuid::new_v4());
    Some((StoreGateway::new(backend), clock, prefix))
}

#[tokio::test]
async fn test_create_get_and_list() {
    skip_if_no_db!();
    let (gateway, _, prefix) = gateway().await.expect("Failed to connect");

    let a = gateway
        .create(&format!("{prefix}/a"), b"one".to_vec(), None)
        .await
        .unwrap();
    let b = gateway
        .create(&format!("{prefix}/dir/b"), b"two".to_vec(), None)
        .await
        .unwrap();
    assert!(b.index > a.index);

    let err = gateway
        .create(&format!("{prefix}/a"), b"again".to_vec(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BbsError::ResourceExists { .. }));

    let node = gateway.get(&format!("{prefix}/a")).await.unwrap();
    assert_eq!(node.value, b"one");
    assert_eq!(node.index, a.index);

    let mut keys: Vec<_> = gateway
        .list(&prefix)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.key)
        .collect();
    keys.sort();
    assert_eq!(keys, vec![format!("{prefix}/a"), format!("{prefix}/dir/b")]);

    gateway.delete_tree(&prefix).await.unwrap();
    assert!(gateway.list(&prefix).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_compare_and_swap_and_delete() {
    skip_if_no_db!();
    let (gateway, _, prefix) = gateway().await.expect("Failed to connect");
    let key = format!("{prefix}/k");

    let created = gateway.create(&key, b"v1".to_vec(), None).await.unwrap();
    let swapped = gateway
        .compare_and_swap_by_index(&key, b"v2".to_vec(), created.index)
        .await
        .unwrap();
    assert!(swapped.index > created.index);

    let err = gateway
        .compare_and_swap_by_index(&key, b"v3".to_vec(), created.index)
        .await
        .unwrap_err();
    assert!(matches!(err, BbsError::IndexMismatch { .. }));
    assert_eq!(gateway.get(&key).await.unwrap().value, b"v2");

    let err = gateway
        .compare_and_delete_by_index(&key, created.index)
        .await
        .unwrap_err();
    assert!(matches!(err, BbsError::IndexMismatch { .. }));

    gateway
        .compare_and_delete_by_index(&key, swapped.index)
        .await
        .unwrap();
    assert!(gateway.get(&key).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_ttl_expiry_follows_the_clock() {
    skip_if_no_db!();
    let (gateway, clock, prefix) = gateway().await.expect("Failed to connect");
    let key = format!("{prefix}/presence");

    gateway
        .set_with_ttl(&key, b"here".to_vec(), Some(Duration::from_secs(10)))
        .await
        .unwrap();
    clock.advance(Duration::from_secs(9));
    assert!(gateway.get(&key).await.is_ok());

    clock.advance(Duration::from_secs(2));
    assert!(gateway.get(&key).await.unwrap_err().is_not_found());
    assert!(gateway.list(&prefix).await.unwrap().is_empty());

    // An expired key can be created again.
    gateway.create(&key, b"back".to_vec(), None).await.unwrap();
}

#[tokio::test]
async fn test_watch_sees_committed_writes() {
    skip_if_no_db!();
    let (gateway, _, prefix) = gateway().await.expect("Failed to connect");
    let key = format!("{prefix}/w");
    let mut watch = gateway.watch(&prefix);

    let created = gateway.create(&key, b"1".to_vec(), None).await.unwrap();
    gateway
        .compare_and_swap_by_index(&key, b"2".to_vec(), created.index)
        .await
        .unwrap();
    gateway.delete(&key).await.unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(2), watch.next())
            .await
            .expect("Timed out waiting for event")
            .expect("Watch closed");
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![
            StoreEventKind::Create,
            StoreEventKind::Update,
            StoreEventKind::Delete
        ]
    );
}
