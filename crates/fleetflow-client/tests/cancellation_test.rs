// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cancellation routing from the server to running queries.

mod common;

use common::*;
use fleetflow_protocol::{Cancel, MONITORING_FLOW_ID, Message, Payload, StatusCode};

/// One cancel instruction reaches every active query of the flow, and a
/// repeated cancel changes nothing.
#[tokio::test]
async fn test_cancel_reaches_all_queries_once() {
    init_tracing();
    let mut client = TestClient::new();

    client
        .dispatch(
            "F.cancel",
            flow_request(vec![
                query(1, 2, &[("hang", "1")]),
                query(2, 2, &[("hang", "1")]),
            ]),
        )
        .await;
    client.wait_for_queries("F.cancel", 2).await;

    for _ in 0..2 {
        client
            .executor
            .process_request(Message::new("F.cancel", Payload::Cancel(Cancel::by("admin"))))
            .await
            .unwrap();
    }
    client.executor.wait_idle().await;

    assert!(client.manager.is_cancelled("F.cancel"));
    assert_eq!(client.manager.active_queries("F.cancel"), 0);

    let messages = client.drain();
    let last = stats(&messages).pop().unwrap();
    assert!(last.flow_complete);
    assert_eq!(last.query_status.len(), 2);
    for status in &last.query_status {
        assert_eq!(status.status, StatusCode::GenericError);
        assert_eq!(status.error_message, "Cancelled");
    }

    let cancelled_lines = log_lines(&messages)
        .iter()
        .filter(|line| *line == "Cancelled all inflight queries for flow F.cancel")
        .count();
    assert_eq!(cancelled_lines, 1);
}

/// Concurrent cancels of the same flow are applied exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cancels_apply_once() {
    let client = TestClient::new();
    client
        .dispatch(
            "F.race",
            flow_request(vec![query(1, 1, &[("hang", "1")])]),
        )
        .await;
    client.wait_for_queries("F.race", 1).await;

    let cancels = (0..8).map(|_| {
        let manager = client.manager.clone();
        tokio::spawn(async move { manager.cancel("F.race") })
    });
    let applied = futures::future::join_all(cancels)
        .await
        .into_iter()
        .filter(|result| *result.as_ref().unwrap())
        .count();

    assert_eq!(applied, 1);
    client.executor.wait_idle().await;
}

/// Cancelling one flow leaves other flows running.
#[tokio::test]
async fn test_cancel_is_scoped_to_flow() {
    let mut client = TestClient::new();

    client
        .dispatch("F.a", flow_request(vec![query(1, 1, &[("hang", "1")])]))
        .await;
    client
        .dispatch("F.b", flow_request(vec![query(1, 1, &[("hang", "1")])]))
        .await;
    client.wait_for_queries("F.a", 1).await;
    client.wait_for_queries("F.b", 1).await;

    assert!(client.manager.cancel("F.a"));

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while client.manager.flow_context("F.a").is_some() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("cancelled flow never closed");

    assert_eq!(client.manager.active_flows(), vec!["F.b".to_string()]);
    assert_eq!(client.manager.active_queries("F.b"), 1);

    client.manager.cancel("F.b");
    client.executor.wait_idle().await;
    let mut completed: Vec<String> = client
        .drain()
        .into_iter()
        .filter_map(|m| match m.payload {
            Payload::FlowStats(s) if s.flow_complete => Some(m.session_id),
            _ => None,
        })
        .collect();
    completed.sort();
    assert_eq!(completed, vec!["F.a".to_string(), "F.b".to_string()]);
}

/// The monitoring flow cannot be cancelled through the protocol.
#[tokio::test]
async fn test_monitoring_flow_survives_cancel() {
    let client = TestClient::new();

    client
        .dispatch(
            MONITORING_FLOW_ID,
            flow_request(vec![query(1, 1, &[("hang", "1")])]),
        )
        .await;
    client.wait_for_queries(MONITORING_FLOW_ID, 1).await;

    client
        .executor
        .process_request(Message::new(
            MONITORING_FLOW_ID,
            Payload::Cancel(Cancel::by("admin")),
        ))
        .await
        .unwrap();

    assert!(!client.manager.is_cancelled(MONITORING_FLOW_ID));
    assert_eq!(client.manager.active_queries(MONITORING_FLOW_ID), 1);

    // Tear down through the context directly.
    client
        .manager
        .flow_context(MONITORING_FLOW_ID)
        .unwrap()
        .cancel();
    client.executor.wait_idle().await;
}
