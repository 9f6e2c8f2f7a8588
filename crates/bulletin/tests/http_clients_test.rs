// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the HTTP clients against a mock server.

mod common;

use std::time::Duration;

use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bulletin::clients::{
    AuctioneerClient, CellClient, ClientError, HttpAuctioneerClient, HttpCellClient,
    HttpTaskCallbackClient, TaskCallbackClient,
};
use bulletin::models::LrpStartRequest;

use common::{desired_lrp, instance_key, lrp_key, task_with_callback};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn only_request_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    requests[0].body_json().unwrap()
}

#[tokio::test]
async fn test_lrp_auction_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/lrps/"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpAuctioneerClient::new(TIMEOUT).unwrap();
    client
        .request_lrp_auctions(
            &server.uri(),
            &[LrpStartRequest::new(desired_lrp("g", 2), vec![0, 1])],
        )
        .await
        .unwrap();

    let body = only_request_body(&server).await;
    assert_eq!(body[0]["desired_lrp"]["process_guid"], "g");
    assert_eq!(body[0]["indices"], serde_json::json!([0, 1]));
}

#[tokio::test]
async fn test_task_auction_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/tasks/"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpAuctioneerClient::new(TIMEOUT).unwrap();
    client
        .request_task_auctions(&format!("{}/", server.uri()), &[task_with_callback("t-1")])
        .await
        .unwrap();

    let body = only_request_body(&server).await;
    assert_eq!(body[0]["task_guid"], "t-1");
}

#[tokio::test]
async fn test_stop_lrp_instance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/lrps/g/instances/i-0/stop"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpCellClient::new(TIMEOUT).unwrap();
    client
        .stop_lrp_instance(&server.uri(), &lrp_key("g", 0), &instance_key("i-0", "cell-a"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancel_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/tasks/t-1/cancel"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpCellClient::new(TIMEOUT).unwrap();
    client.cancel_task(&server.uri(), "t-1").await.unwrap();
}

#[tokio::test]
async fn test_complete_tasks() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/internal/tasks/complete"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpTaskCallbackClient::new(TIMEOUT).unwrap();
    client
        .complete_tasks(&server.uri(), &[task_with_callback("a"), task_with_callback("b")])
        .await
        .unwrap();

    let body = only_request_body(&server).await;
    assert_eq!(body.as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_unexpected_status_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/tasks/t-1/cancel"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = HttpCellClient::new(TIMEOUT).unwrap();
    let err = client.cancel_task(&server.uri(), "t-1").await.unwrap_err();
    match err {
        ClientError::UnexpectedStatus { status, url } => {
            assert_eq!(status, 500);
            assert!(url.ends_with("/v1/tasks/t-1/cancel"));
        }
        other => panic!("Expected UnexpectedStatus, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_is_a_request_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/lrps/"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let client = HttpAuctioneerClient::new(Duration::from_millis(50)).unwrap();
    let err = client
        .request_lrp_auctions(&server.uri(), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Request(_)));
}
