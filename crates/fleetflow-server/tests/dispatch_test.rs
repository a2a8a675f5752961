// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for scheduling, cancellation and in-flight tracking,
//! plus a round trip through a real client executor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use async_trait::async_trait;
use fleetflow_client::{
    ClientConfig, ClientExecutor, DEFAULT_CHUNK_SIZE, FlowManager, QueryEngine, QueryError,
    QueryResponder, Throttle, Throttler, UploadSpan, upload_ranges,
};
use fleetflow_protocol::{
    Cancel, Message, PathSpec, Payload, QueryRequest, STATUS_CHECK_FLOW_ID, StatusCode,
    UploadIndex,
};
use fleetflow_server::{Config, FlowPathManager, FlowState, UPLOAD_COMPLETION_QUEUE};
use tokio::sync::mpsc;

fn flow_ids(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| matches!(m.payload, Payload::FlowRequest(_)))
        .map(|m| m.session_id.clone())
        .collect()
}

#[tokio::test]
async fn test_client_receives_at_most_max_in_flight() {
    let server = TestServer::with_config(Config::default().with_client_concurrency(0)).await;
    let first = server.schedule(1).await;
    let second = server.schedule(1).await;
    let third = server.schedule(1).await;

    let handed = flow_ids(&server.post(vec![]).await);
    assert_eq!(handed, vec![first.clone(), second.clone()]);
    assert_eq!(server.context(&first).await.state, FlowState::Waiting);
    assert_eq!(server.context(&third).await.state, FlowState::Running);

    // Still full.
    assert!(server.post(vec![]).await.is_empty());

    let reply = server
        .post(vec![stats(&first, vec![status(1, StatusCode::Ok)], true)])
        .await;
    assert_eq!(flow_ids(&reply), vec![third]);
}

#[tokio::test]
async fn test_cancel_flow_reaches_client() {
    let server = TestServer::new().await;
    let flow_id = server.schedule(2).await;
    server.post(vec![]).await;
    server
        .post(vec![stats(
            &flow_id,
            vec![status(1, StatusCode::Ok), status(2, StatusCode::Progress)],
            false,
        )])
        .await;

    assert!(
        server
            .runtime
            .launcher()
            .cancel_flow(CLIENT, &flow_id, "alice")
            .await
            .unwrap()
    );

    let reply = server.post(vec![]).await;
    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0].session_id, flow_id);
    assert_eq!(reply[0].payload, Payload::Cancel(Cancel::by("alice")));

    let ctx = server.context(&flow_id).await;
    assert_eq!(ctx.state, FlowState::Error);
    assert_eq!(ctx.status, "Cancelled by alice");
    assert_eq!(ctx.query_stats[0].status, StatusCode::Ok);
    assert_eq!(ctx.query_stats[1].error_message, "Cancelled by alice");
}

#[tokio::test]
async fn test_cancel_before_delivery_drops_request() {
    let server = TestServer::new().await;
    let flow_id = server.schedule(1).await;

    server
        .runtime
        .launcher()
        .cancel_flow(CLIENT, &flow_id, "alice")
        .await
        .unwrap();

    let reply = server.post(vec![]).await;
    assert!(flow_ids(&reply).is_empty());
    assert_eq!(reply.len(), 1);
    assert!(matches!(reply[0].payload, Payload::Cancel(_)));
}

#[tokio::test]
async fn test_silent_flow_becomes_unresponsive() {
    let server = TestServer::new().await;
    let flow_id = server.schedule(1).await;
    server.post(vec![]).await;

    let later = chrono::Utc::now() + chrono::Duration::seconds(601);
    let marked = server
        .runtime
        .client_info()
        .check_unresponsive(later, Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(marked, vec![(CLIENT.to_string(), flow_id.clone())]);
    assert_eq!(server.context(&flow_id).await.state, FlowState::Unresponsive);

    // The client comes back.
    server
        .post(vec![stats(&flow_id, vec![status(1, StatusCode::Progress)], false)])
        .await;
    assert_eq!(server.context(&flow_id).await.state, FlowState::InProgress);
}

#[tokio::test]
async fn test_stale_in_flight_flow_is_probed() {
    let server = TestServer::new().await;
    let flow_id = server.schedule(1).await;
    server.post(vec![]).await;

    let later = chrono::Utc::now() + chrono::Duration::seconds(120);
    let tasks = server
        .runtime
        .client_info()
        .get_client_tasks_at(CLIENT, later)
        .await;

    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].session_id, STATUS_CHECK_FLOW_ID);
    let Payload::FlowStatsRequest(probe) = &tasks[0].payload else {
        panic!("expected a stats probe");
    };
    assert_eq!(probe.flow_ids, vec![flow_id]);
}

// ============================================================================
// Round trip
// ============================================================================

struct Endpoint {
    executor: ClientExecutor,
    outbound: mpsc::Receiver<Message>,
}

impl Endpoint {
    fn new() -> Self {
        Self::with_engine(Arc::new(RowsEngine))
    }

    fn with_engine(engine: Arc<dyn QueryEngine>) -> Self {
        let config = ClientConfig::new(CLIENT).with_output_buffer(256);
        let (output, outbound) = mpsc::channel(config.output_buffer);
        let executor = ClientExecutor::new(
            config,
            FlowManager::new(),
            engine,
            Throttler::new(1),
            output,
        );
        Self { executor, outbound }
    }

    /// Run everything the server handed out and collect what the client sent.
    async fn run(&mut self, tasks: Vec<Message>) -> Vec<Message> {
        for task in tasks {
            self.executor.process_request(task).await.unwrap();
        }
        self.executor.wait_idle().await;

        let mut sent = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            sent.push(message);
        }
        sent
    }
}

#[tokio::test]
async fn test_round_trip_through_client() {
    init_tracing();
    let server = TestServer::new().await;
    let mut endpoint = Endpoint::new();
    let flow_id = server.schedule(2).await;

    let tasks = server.post(vec![]).await;
    let sent = endpoint.run(tasks).await;
    assert!(server.post(sent).await.is_empty());

    let ctx = server.context(&flow_id).await;
    assert_eq!(ctx.state, FlowState::Finished);
    assert_eq!(ctx.total_collected_rows, 4);
    assert_eq!(ctx.outstanding_requests, 0);
    assert_eq!(
        ctx.artifacts_with_results,
        vec![format!("{}/1", ARTIFACT), format!("{}/2", ARTIFACT)]
    );

    let paths = FlowPathManager::new(CLIENT, &flow_id);
    assert_eq!(server.rows(&paths.artifact(&format!("{}/1", ARTIFACT))).await.len(), 2);
    assert_eq!(server.completions().len(), 1);
    assert!(server.runtime.client_info().in_flight(CLIENT).is_empty());
}

/// A probe for a flow the client has forgotten fails the flow.
#[tokio::test]
async fn test_probe_of_forgotten_flow_fails_it() {
    let server = TestServer::new().await;
    let mut endpoint = Endpoint::new();
    let flow_id = server.schedule(1).await;
    // Handed out, but the client restarts before running it.
    server.post(vec![]).await;

    let later = chrono::Utc::now() + chrono::Duration::seconds(120);
    let probe = server
        .runtime
        .client_info()
        .get_client_tasks_at(CLIENT, later)
        .await;
    let sent = endpoint.run(probe).await;
    server.post(sent).await;

    let ctx = server.context(&flow_id).await;
    assert_eq!(ctx.state, FlowState::Error);
    assert_eq!(ctx.status, fleetflow_protocol::UNKNOWN_FLOW_MESSAGE);
    assert_eq!(server.completions().len(), 1);
}

/// Uploads an 18 byte file whose middle 6 bytes are a hole.
struct SparseUploadEngine;

#[async_trait]
impl QueryEngine for SparseUploadEngine {
    async fn execute(
        &self,
        _query: &QueryRequest,
        responder: &mut QueryResponder,
        _throttle: &Throttle,
    ) -> Result<(), QueryError> {
        let spans = [
            UploadSpan::data(0, 6),
            UploadSpan::sparse(6, 6),
            UploadSpan::data(12, 6),
        ];
        upload_ranges(
            responder,
            PathSpec {
                accessor: "file".into(),
                path: "/tmp/sparse.txt".into(),
                components: vec!["tmp".into(), "sparse.txt".into()],
            },
            b"Hello world hello world",
            &spans,
            DEFAULT_CHUNK_SIZE,
        )
        .await
        .map(|_| ())
        .map_err(|e| QueryError::new(e.to_string()))
    }
}

#[tokio::test]
async fn test_sparse_upload_round_trip() {
    let server = TestServer::new().await;
    let mut endpoint = Endpoint::with_engine(Arc::new(SparseUploadEngine));
    let flow_id = server.schedule(1).await;

    let tasks = server.post(vec![]).await;
    let sent = endpoint.run(tasks).await;
    server.post(sent).await;

    let paths = FlowPathManager::new(CLIENT, &flow_id);
    let file = paths.upload_file("file", &["tmp".into(), "sparse.txt".into()]);
    assert_eq!(server.files.get(&file).unwrap(), b"Hello hello ");

    let index = server.files.get(&FlowPathManager::upload_index(&file)).unwrap();
    let index: UploadIndex = serde_json::from_slice(&index).unwrap();
    assert_eq!(index.ranges.len(), 3);
    assert_eq!(index.ranges[1].file_length, 0);
    assert_eq!(index.ranges[2].original_offset, 12);

    let ctx = server.context(&flow_id).await;
    assert_eq!(ctx.state, FlowState::Finished);
    assert_eq!(ctx.total_uploaded_files, 1);
    assert_eq!(ctx.total_uploaded_bytes, 12);
    assert_eq!(ctx.total_expected_uploaded_bytes, 12);

    let events = server.journal.rows(UPLOAD_COMPLETION_QUEUE);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["Size"], 18);
    assert_eq!(events[0]["UploadedSize"], 12);
}
