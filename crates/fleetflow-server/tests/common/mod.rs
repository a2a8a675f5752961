// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fleetflow-server integration tests.
//!
//! Provides a TestServer wrapping a runtime over in-memory storage, message
//! builders for what clients send, and a minimal query engine for driving
//! a real client executor against the server.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fleetflow_client::{QueryEngine, QueryError, QueryResponder, Throttle};
use fleetflow_protocol::frame::{decode_batch, encode_batch};
use fleetflow_protocol::{
    FlowRequest, FlowStats, LogLine, LogMessage, Message, NamedQuery, Payload, QueryRequest,
    QueryStatus, StatusCode, VqlResponse,
};
use fleetflow_server::{
    CollectionContext, Config, FLOW_COMPLETION_QUEUE, FleetServerRuntime, MemoryFileStore,
    MemoryJournal, ResultSetReader, StorePath,
};
use serde_json::Value;

pub const CLIENT: &str = "C.test";
pub const ARTIFACT: &str = "Test.Artifact";

pub struct TestServer {
    pub runtime: FleetServerRuntime,
    pub files: Arc<MemoryFileStore>,
    pub journal: Arc<MemoryJournal>,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let files = Arc::new(MemoryFileStore::new());
        let journal = Arc::new(MemoryJournal::new());
        let runtime = FleetServerRuntime::builder()
            .store(files.clone())
            .journal(journal.clone())
            .config(config)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        Self {
            runtime,
            files,
            journal,
        }
    }

    /// Schedule a flow of `queries` one-source queries.
    pub async fn schedule(&self, queries: u64) -> String {
        self.schedule_request(request(queries)).await
    }

    pub async fn schedule_request(&self, request: FlowRequest) -> String {
        self.runtime
            .launcher()
            .schedule_flow(CLIENT, request, "admin")
            .await
            .unwrap()
    }

    /// POST `messages` as the test client and decode the reply.
    pub async fn post(&self, messages: Vec<Message>) -> Vec<Message> {
        let reply = self.try_post(messages).await.unwrap();
        decode_batch(reply).unwrap()
    }

    pub async fn try_post(&self, messages: Vec<Message>) -> fleetflow_server::Result<Bytes> {
        let body = encode_batch(&messages).unwrap();
        self.runtime.handle_post(CLIENT, body).await
    }

    pub async fn context(&self, flow_id: &str) -> CollectionContext {
        self.runtime
            .flow_store()
            .load(CLIENT, flow_id)
            .await
            .unwrap()
            .expect("no record for flow")
    }

    pub async fn rows(&self, path: &StorePath) -> Vec<Value> {
        ResultSetReader::open(self.files.as_ref(), path)
            .await
            .unwrap()
            .rows()
            .unwrap()
    }

    pub fn completions(&self) -> Vec<Value> {
        self.journal.rows(FLOW_COMPLETION_QUEUE)
    }
}

pub fn request(queries: u64) -> FlowRequest {
    FlowRequest {
        queries: (1..=queries)
            .map(|id| QueryRequest {
                artifact: ARTIFACT.to_string(),
                sources: vec![NamedQuery {
                    name: format!("{}/{}", ARTIFACT, id),
                    vql: "SELECT * FROM info()".to_string(),
                }],
                ..Default::default()
            })
            .collect(),
        flow_update_time_ms: 3_600_000,
        log_batch_time_ms: 3_600_000,
        ..Default::default()
    }
}

/// A result packet of `rows` rows for query `query_id`.
pub fn packet(flow_id: &str, query_id: u64, start: u64, part: u64, rows: u64) -> Message {
    packet_named(flow_id, &format!("{}/{}", ARTIFACT, query_id), start, part, rows)
}

pub fn packet_named(flow_id: &str, name: &str, start: u64, part: u64, rows: u64) -> Message {
    let jsonl = (start..start + rows)
        .map(|row| format!("{{\"Row\":{}}}\n", row))
        .collect();
    Message::new(
        flow_id,
        Payload::VqlResponse(VqlResponse {
            query: NamedQuery {
                name: name.to_string(),
                vql: String::new(),
            },
            jsonl_response: jsonl,
            total_rows: rows,
            query_start_row: start,
            part,
            ..Default::default()
        }),
    )
}

pub fn status(query_id: u64, code: StatusCode) -> QueryStatus {
    QueryStatus {
        status: code,
        query_id,
        ..Default::default()
    }
}

pub fn error_status(query_id: u64, message: &str) -> QueryStatus {
    QueryStatus {
        error_message: message.to_string(),
        ..status(query_id, StatusCode::GenericError)
    }
}

pub fn stats(flow_id: &str, statuses: Vec<QueryStatus>, complete: bool) -> Message {
    Message::new(
        flow_id,
        Payload::FlowStats(FlowStats {
            query_status: statuses,
            flow_complete: complete,
            ..Default::default()
        }),
    )
}

pub fn log_batch(flow_id: &str, id: u64, lines: &[(&str, &str)]) -> Message {
    let jsonl: String = lines
        .iter()
        .map(|(level, message)| {
            LogLine {
                client_time: 1_700_000_000,
                level: level.to_string(),
                message: message.to_string(),
            }
            .to_jsonl()
        })
        .collect();
    Message::new(
        flow_id,
        Payload::LogMessage(LogMessage {
            id,
            number_of_rows: lines.len() as u64,
            jsonl,
            ..Default::default()
        }),
    )
}

/// Engine sending `rows` rows (from the query's env, default 2) per source.
pub struct RowsEngine;

#[async_trait]
impl QueryEngine for RowsEngine {
    async fn execute(
        &self,
        query: &QueryRequest,
        responder: &mut QueryResponder,
        throttle: &Throttle,
    ) -> Result<(), QueryError> {
        let rows: u64 = query
            .env
            .get("rows")
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);
        for source in &query.sources {
            throttle
                .charge_op(responder.scope())
                .await
                .map_err(|e| QueryError::new(e.to_string()))?;
            responder
                .add_response(&source.name, "{\"x\":1}\n".repeat(rows as usize), rows)
                .await
                .map_err(|e| QueryError::new(e.to_string()))?;
        }
        Ok(())
    }
}

/// Install a test subscriber honouring RUST_LOG. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
