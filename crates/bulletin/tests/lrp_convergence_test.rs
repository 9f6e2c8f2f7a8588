// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for LRP convergence against a live (in-memory) store.

mod common;

use std::time::Duration;

use bulletin::clock::Clock;
use bulletin::metrics;
use bulletin::models::{ActualLrp, ActualLrpState};
use bulletin::paths::{self, Slot};

use common::{TestContext, desired_lrp, instance_key, lrp_key, net_info, rep_address};

/// Desired `g` with two instances and three running actuals on `cell-a`.
async fn three_running_for_two_desired() -> TestContext {
    let ctx = TestContext::new().await;
    ctx.add_cell("cell-a").await;
    ctx.bbs
        .desired_lrps()
        .desire_lrp(desired_lrp("g", 2))
        .await
        .unwrap();
    for index in 0..3 {
        ctx.bbs
            .actual_lrps()
            .start_actual_lrp(
                &lrp_key("g", index),
                &instance_key(&format!("i-{index}"), "cell-a"),
                &net_info("10.0.0.1", 61000 + index as u16),
            )
            .await
            .unwrap();
    }
    ctx.auctioneer.clear().await;
    ctx
}

#[tokio::test]
async fn test_extra_index_is_retired_when_domain_is_fresh() {
    let ctx = three_running_for_two_desired().await;
    ctx.fresh_domain().await;

    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();

    assert_eq!(changes.actual_lrps_for_extra_indices.len(), 1);
    assert_eq!(changes.actual_lrps_for_extra_indices[0].lrp.key, lrp_key("g", 2));

    let stops = ctx.cells.stops().await;
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].address, rep_address("cell-a"));
    assert_eq!(stops[0].key, lrp_key("g", 2));
    assert!(ctx.auctioneer.lrp_calls().await.is_empty());
}

#[tokio::test]
async fn test_extra_index_is_kept_when_domain_is_stale() {
    let ctx = three_running_for_two_desired().await;

    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();

    assert!(changes.actual_lrps_for_extra_indices.is_empty());
    assert!(ctx.cells.stops().await.is_empty());
    assert!(ctx.auctioneer.lrp_calls().await.is_empty());
    assert!(
        ctx.bbs
            .actual_lrp_repo()
            .instance(&lrp_key("g", 2))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_idle_extra_index_is_deleted() {
    let ctx = TestContext::new().await;
    ctx.fresh_domain().await;
    ctx.bbs
        .desired_lrps()
        .desire_lrp(desired_lrp("g", 1))
        .await
        .unwrap();
    ctx.bbs
        .actual_lrp_repo()
        .create_unclaimed(&lrp_key("g", 5))
        .await
        .unwrap();

    ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();

    let err = ctx
        .bbs
        .actual_lrp_repo()
        .instance(&lrp_key("g", 5))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(ctx.cells.stops().await.is_empty());
}

#[tokio::test]
async fn test_missing_index_is_recreated_and_auctioned() {
    let ctx = TestContext::new().await;
    ctx.fresh_domain().await;
    ctx.bbs
        .desired_lrps()
        .desire_lrp(desired_lrp("g", 2))
        .await
        .unwrap();
    ctx.bbs
        .gateway()
        .delete(&paths::actual_lrp("g", 1, Slot::Instance))
        .await
        .unwrap();
    ctx.auctioneer.clear().await;

    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();

    assert_eq!(changes.actual_lrp_keys_for_missing_indices, vec![lrp_key("g", 1)]);
    let (lrp, _) = ctx
        .bbs
        .actual_lrp_repo()
        .instance(&lrp_key("g", 1))
        .await
        .unwrap();
    assert_eq!(lrp.state, ActualLrpState::Unclaimed);
    assert_eq!(
        ctx.auctioneer.requested_indices().await,
        vec![("g".to_string(), 1)]
    );
}

#[tokio::test]
async fn test_instance_on_missing_cell_is_unclaimed_and_auctioned() {
    let ctx = TestContext::new().await;
    ctx.fresh_domain().await;
    ctx.bbs
        .desired_lrps()
        .desire_lrp(desired_lrp("g", 1))
        .await
        .unwrap();
    ctx.bbs
        .actual_lrps()
        .start_actual_lrp(&lrp_key("g", 0), &instance_key("i-0", "cell-gone"), &net_info("10.0.0.1", 61000))
        .await
        .unwrap();
    ctx.auctioneer.clear().await;

    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();

    assert_eq!(changes.actual_lrps_with_missing_cells.len(), 1);
    let (lrp, _) = ctx
        .bbs
        .actual_lrp_repo()
        .instance(&lrp_key("g", 0))
        .await
        .unwrap();
    assert_eq!(lrp.state, ActualLrpState::Unclaimed);
    assert!(lrp.instance_key.is_empty());
    assert!(lrp.net_info.is_empty());
    assert_eq!(
        ctx.auctioneer.requested_indices().await,
        vec![("g".to_string(), 0)]
    );
}

#[tokio::test]
async fn test_instance_on_live_cell_is_left_alone() {
    let ctx = TestContext::new().await;
    ctx.fresh_domain().await;
    ctx.add_cell("cell-a").await;
    ctx.bbs
        .desired_lrps()
        .desire_lrp(desired_lrp("g", 1))
        .await
        .unwrap();
    ctx.bbs
        .actual_lrps()
        .start_actual_lrp(&lrp_key("g", 0), &instance_key("i-0", "cell-a"), &net_info("10.0.0.1", 61000))
        .await
        .unwrap();
    ctx.auctioneer.clear().await;
    let before = ctx.backend.last_index().await;

    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();

    assert!(changes.is_empty());
    assert_eq!(ctx.backend.last_index().await, before);
    assert!(ctx.auctioneer.lrp_calls().await.is_empty());
}

#[tokio::test]
async fn test_crashed_instance_restarts_after_backoff() {
    let ctx = TestContext::new().await;
    ctx.fresh_domain().await;
    ctx.bbs
        .desired_lrps()
        .desire_lrp(desired_lrp("g", 1))
        .await
        .unwrap();
    let key = lrp_key("g", 0);
    let ik = instance_key("i-0", "cell-a");
    for _ in 0..4 {
        ctx.bbs.actual_lrps().claim_actual_lrp(&key, &ik).await.unwrap();
        ctx.bbs
            .actual_lrps()
            .crash_actual_lrp(&key, &ik, "exit 1")
            .await
            .unwrap();
    }
    ctx.auctioneer.clear().await;

    // Four crashes wait one minute.
    ctx.advance(Duration::from_secs(59));
    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();
    assert!(changes.restartable_crashed_actual_lrps.is_empty());
    assert!(ctx.auctioneer.lrp_calls().await.is_empty());

    ctx.advance(Duration::from_secs(2));
    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();
    assert_eq!(changes.restartable_crashed_actual_lrps.len(), 1);

    let (lrp, _) = ctx.bbs.actual_lrp_repo().instance(&key).await.unwrap();
    assert_eq!(lrp.state, ActualLrpState::Unclaimed);
    assert_eq!(lrp.crash_count, 4);
    assert_eq!(
        ctx.auctioneer.requested_indices().await,
        vec![("g".to_string(), 0)]
    );
}

#[tokio::test]
async fn test_stale_unclaimed_is_auctioned_again() {
    let ctx = TestContext::new().await;
    ctx.fresh_domain().await;
    ctx.bbs
        .desired_lrps()
        .desire_lrp(desired_lrp("g", 2))
        .await
        .unwrap();
    ctx.auctioneer.clear().await;

    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();
    assert!(changes.stale_unclaimed_actual_lrps.is_empty());

    ctx.advance(Duration::from_secs(31));
    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();
    assert_eq!(changes.stale_unclaimed_actual_lrps.len(), 2);

    // Both indices go out in one coalesced request.
    let calls = ctx.auctioneer.lrp_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].starts.len(), 1);
    assert_eq!(calls[0].starts[0].indices, vec![0, 1]);
}

#[tokio::test]
async fn test_orphan_is_retired_only_in_a_fresh_domain() {
    let ctx = TestContext::new().await;
    ctx.add_cell("cell-a").await;
    ctx.bbs
        .actual_lrps()
        .start_actual_lrp(&lrp_key("orphan", 0), &instance_key("i-0", "cell-a"), &net_info("10.0.0.1", 61000))
        .await
        .unwrap();

    ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();
    assert!(ctx.cells.stops().await.is_empty());

    ctx.fresh_domain().await;
    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();
    assert_eq!(changes.actual_lrps_for_extra_indices.len(), 1);
    let stops = ctx.cells.stops().await;
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].key, lrp_key("orphan", 0));
    assert!(ctx.auctioneer.lrp_calls().await.is_empty());
}

#[tokio::test]
async fn test_evacuating_copies_are_not_converged() {
    let ctx = TestContext::new().await;
    ctx.fresh_domain().await;
    let key = lrp_key("draining", 0);
    let copy = ActualLrp::new_running(
        key.clone(),
        instance_key("i-0", "cell-gone"),
        net_info("10.0.0.1", 61000),
        ctx.clock.now_nanos(),
    );
    ctx.bbs
        .actual_lrp_repo()
        .set_evacuating(&copy, Duration::from_secs(60))
        .await
        .unwrap();

    let changes = ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();

    assert!(changes.is_empty());
    assert!(ctx.bbs.actual_lrp_repo().evacuating(&key).await.is_ok());
}

#[tokio::test]
async fn test_malformed_records_are_pruned() {
    let ctx = TestContext::new().await;
    let gateway = ctx.bbs.gateway();
    gateway
        .set_with_ttl(&paths::actual_lrp("bad", 0, Slot::Instance), b"{nope".to_vec(), None)
        .await
        .unwrap();
    gateway
        .set_with_ttl("/v1/actual/bad/not-a-number/instance", b"{}".to_vec(), None)
        .await
        .unwrap();
    gateway
        .set_with_ttl(&paths::desired_lrp("bad"), b"[]".to_vec(), None)
        .await
        .unwrap();

    ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();

    assert!(gateway.list(paths::ACTUAL_LRP_ROOT).await.unwrap().is_empty());
    assert!(gateway.list(paths::DESIRED_LRP_ROOT).await.unwrap().is_empty());
    assert_eq!(
        ctx.metrics
            .counter(metrics::CONVERGENCE_LRP_PRE_PROCESSING_ACTUAL_LRPS_DELETED),
        2
    );
    assert_eq!(
        ctx.metrics
            .counter(metrics::CONVERGENCE_LRP_PRE_PROCESSING_DESIRED_LRPS_DELETED),
        1
    );
}

#[tokio::test]
async fn test_convergence_records_metrics() {
    let ctx = three_running_for_two_desired().await;

    ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();
    ctx.bbs.lrp_convergence().converge_lrps().await.unwrap();

    assert_eq!(ctx.metrics.counter(metrics::CONVERGENCE_LRP_RUNS), 2);
    assert_eq!(ctx.metrics.durations(metrics::CONVERGENCE_LRP_DURATION).len(), 2);
    assert_eq!(ctx.metrics.gauge(metrics::LRPS_RUNNING), Some(3.0));
    assert_eq!(ctx.metrics.gauge(metrics::LRPS_UNCLAIMED), Some(0.0));
    assert_eq!(ctx.metrics.gauge(metrics::LRPS_DESIRED), Some(2.0));
    assert_eq!(ctx.metrics.gauge(metrics::LRPS_MISSING), Some(0.0));
    assert_eq!(ctx.metrics.gauge(metrics::LRPS_EXTRA), Some(0.0));
}
