// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for flow dispatch through the client executor.

mod common;

use common::*;
use fleetflow_client::FlowError;
use fleetflow_protocol::{Cancel, Message, Payload, StatusCode};

// ============================================================================
// Completion
// ============================================================================

/// Results of every query go out before the final stats report.
#[tokio::test]
async fn test_flow_runs_to_completion() {
    init_tracing();
    let mut client = TestClient::new();

    let request = flow_request(vec![
        query(1, 2, &[("packets", "2"), ("rows", "3")]),
        query(2, 2, &[("packets", "2"), ("rows", "3")]),
    ]);
    client.dispatch("F.complete", request).await;
    client.executor.wait_idle().await;

    let messages = client.drain();
    assert_eq!(responses(&messages).len(), 4);

    let Payload::FlowStats(last) = &messages.last().unwrap().payload else {
        panic!("final stats must be the last message of the flow");
    };
    assert!(last.flow_complete);
    assert_eq!(last.total_collected_rows, 12);
    assert_eq!(last.query_status.len(), 2);
    assert!(last.query_status.iter().all(|s| s.status == StatusCode::Ok));
    assert!(client.manager.active_flows().is_empty());
}

/// Each packet of a source carries the row offset of its first row.
#[tokio::test]
async fn test_packets_carry_increasing_row_offsets() {
    let mut client = TestClient::new();

    client
        .dispatch(
            "F.offsets",
            flow_request(vec![query(1, 1, &[("packets", "3"), ("rows", "2")])]),
        )
        .await;
    client.executor.wait_idle().await;

    let offsets: Vec<(u64, u64)> = responses(&client.drain())
        .iter()
        .map(|r| (r.query_start_row, r.part))
        .collect();
    assert_eq!(offsets, vec![(0, 0), (2, 1), (4, 2)]);
}

// ============================================================================
// Errors
// ============================================================================

/// A failing query reports its message and backtrace in the final stats.
#[tokio::test]
async fn test_query_error_is_reported() {
    let mut client = TestClient::new();

    client
        .dispatch(
            "F.error",
            flow_request(vec![
                query(1, 2, &[("fail", "boom")]),
                query(2, 2, &[("rows", "1")]),
            ]),
        )
        .await;
    client.executor.wait_idle().await;

    let stats = stats(&client.drain());
    let last = stats.last().unwrap();
    assert!(last.flow_complete);

    let failed = last.query_status.iter().find(|s| s.query_id == 1).unwrap();
    assert_eq!(failed.status, StatusCode::GenericError);
    assert_eq!(failed.error_message, "boom");
    assert_eq!(failed.backtrace, "I am a backtrace");

    let ok = last.query_status.iter().find(|s| s.query_id == 2).unwrap();
    assert_eq!(ok.status, StatusCode::Ok);
}

/// Queries exceeding the flow timeout fail with a timeout message.
#[tokio::test(start_paused = true)]
async fn test_query_timeout() {
    let mut client = TestClient::new();

    let mut request = flow_request(vec![query(1, 1, &[("hang", "1")])]);
    request.timeout_secs = 1;
    client.dispatch("F.timeout", request).await;
    client.executor.wait_idle().await;

    let stats = stats(&client.drain());
    let status = &stats.last().unwrap().query_status[0];
    assert_eq!(status.status, StatusCode::GenericError);
    assert_eq!(status.error_message, "Query timed out after 1 seconds");
}

/// Messages the client never expects from the server are rejected.
#[tokio::test]
async fn test_unexpected_message_is_rejected() {
    let client = TestClient::new();

    let err = client
        .executor
        .process_request(Message::new(
            "F.1",
            Payload::LogMessage(Default::default()),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::UnexpectedMessage(_)));
}

// ============================================================================
// Quotas
// ============================================================================

/// Crossing the row quota cancels the flow and records the reason once.
#[tokio::test]
async fn test_row_quota_cancels_flow() {
    let mut client = TestClient::new();

    let mut request = flow_request(vec![query(1, 1, &[("packets", "3"), ("rows", "3")])]);
    request.max_rows = 5;
    client.dispatch("F.quota", request).await;
    client.executor.wait_idle().await;

    let messages = client.drain();
    let last = stats(&messages).pop().unwrap();
    assert!(last.flow_complete);
    assert_eq!(last.query_status[0].status, StatusCode::GenericError);
    assert_eq!(
        last.query_status[0].error_message,
        "Rows 6 exceeded limit 5 for flow F.quota. Cancelling."
    );

    let lines = log_lines(&messages);
    assert_eq!(
        lines,
        vec![
            "Rows 6 exceeded limit 5 for flow F.quota. Cancelling.".to_string(),
            "Cancelled all inflight queries for flow F.quota".to_string(),
        ]
    );
    let batches = logs(&messages);
    assert_eq!(
        batches[0].error_message,
        "Rows 6 exceeded limit 5 for flow F.quota. Cancelling."
    );
}

/// Reaching the quota exactly is still allowed.
#[tokio::test]
async fn test_row_quota_is_strict() {
    let mut client = TestClient::new();

    let mut request = flow_request(vec![query(1, 1, &[("packets", "2"), ("rows", "3")])]);
    request.max_rows = 6;
    client.dispatch("F.exact", request).await;
    client.executor.wait_idle().await;

    let messages = client.drain();
    let last = stats(&messages).pop().unwrap();
    assert_eq!(last.query_status[0].status, StatusCode::Ok);
    assert!(log_lines(&messages).is_empty());
}

// ============================================================================
// Dispatch rules
// ============================================================================

/// A second request for a running flow does not start it again.
#[tokio::test]
async fn test_duplicate_flow_request_is_ignored() {
    let mut client = TestClient::new();

    let request = flow_request(vec![query(1, 1, &[("hang", "1")])]);
    client.dispatch("F.dup", request.clone()).await;
    client.wait_for_queries("F.dup", 1).await;
    client.dispatch("F.dup", request).await;

    assert_eq!(client.manager.active_queries("F.dup"), 1);

    client
        .executor
        .process_request(Message::new("F.dup", Payload::Cancel(Cancel::by("admin"))))
        .await
        .unwrap();
    client.executor.wait_idle().await;

    let final_reports = stats(&client.drain())
        .into_iter()
        .filter(|s| s.flow_complete)
        .count();
    assert_eq!(final_reports, 1);
}

/// A flow cancelled before its request arrives never starts.
#[tokio::test]
async fn test_cancelled_flow_does_not_start() {
    let mut client = TestClient::new();
    assert!(client.manager.cancel("F.early"));

    client
        .dispatch("F.early", flow_request(vec![query(1, 1, &[])]))
        .await;
    client.executor.wait_idle().await;

    assert!(client.manager.active_flows().is_empty());
    assert!(client.drain().is_empty());
}

// ============================================================================
// Status probes
// ============================================================================

/// A probe gets a progress report for running flows and an unknown-flow
/// report for everything else.
#[tokio::test]
async fn test_stats_probe() {
    let mut client = TestClient::new();

    client
        .dispatch(
            "F.running",
            flow_request(vec![query(1, 1, &[("hang", "1")])]),
        )
        .await;
    client.wait_for_queries("F.running", 1).await;

    let probe = fleetflow_protocol::FlowStatsRequest {
        flow_ids: vec!["F.running".to_string(), "F.gone".to_string()],
    };
    client
        .executor
        .process_request(Message::new(
            fleetflow_protocol::STATUS_CHECK_FLOW_ID,
            Payload::FlowStatsRequest(probe),
        ))
        .await
        .unwrap();

    let mut reports = Vec::new();
    while reports.len() < 2 {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), client.outbound.recv())
            .await
            .expect("probe not answered")
            .unwrap();
        if let Payload::FlowStats(stats) = msg.payload {
            reports.push((msg.session_id, stats));
        }
    }

    let running = reports.iter().find(|(id, _)| id == "F.running").unwrap();
    assert!(!running.1.flow_complete);
    assert_eq!(running.1.query_status[0].status, StatusCode::Progress);

    let gone = reports.iter().find(|(id, _)| id == "F.gone").unwrap();
    assert!(gone.1.flow_complete);
    assert_eq!(gone.1.query_status[0].status, StatusCode::UnknownFlow);

    client.manager.cancel("F.running");
    client.executor.wait_idle().await;
}
