// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fleetflow-client integration tests.
//!
//! Provides a scripted query engine driven by each query's `env` and a
//! TestClient bundling an executor with its output channel.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetflow_client::{
    ClientConfig, ClientExecutor, FlowManager, QueryEngine, QueryError, QueryResponder, Throttle,
    Throttler,
};
use fleetflow_protocol::{
    FlowRequest, FlowStats, LogMessage, Message, Payload, QueryRequest, VqlResponse,
};
use tokio::sync::mpsc;

/// Query engine whose behaviour is read from the query's env:
///
/// - `packets`: number of result packets to send (default 1)
/// - `rows`: rows per packet (default 1)
/// - `fail`: fail with this message after sending results
/// - `hang`: block until the query is cancelled
/// - `log`: write this line to the flow log first
pub struct ScriptedEngine;

#[async_trait]
impl QueryEngine for ScriptedEngine {
    async fn execute(
        &self,
        query: &QueryRequest,
        responder: &mut QueryResponder,
        throttle: &Throttle,
    ) -> Result<(), QueryError> {
        let env = |key: &str| query.env.get(key).cloned();
        let packets: u64 = env("packets").and_then(|v| v.parse().ok()).unwrap_or(1);
        let rows: u64 = env("rows").and_then(|v| v.parse().ok()).unwrap_or(1);
        let source = query
            .sources
            .first()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "Test.Artifact".to_string());

        if let Some(line) = env("log") {
            responder.log(fleetflow_protocol::LEVEL_DEFAULT, line);
        }

        if env("hang").is_some() {
            responder.scope().cancelled().await;
            return Err(QueryError::new("Cancelled"));
        }

        for _ in 0..packets {
            throttle
                .charge_op(responder.scope())
                .await
                .map_err(|e| QueryError::new(e.to_string()))?;
            let jsonl = "{\"x\":1}\n".repeat(rows as usize);
            responder
                .add_response(&source, jsonl, rows)
                .await
                .map_err(|e| QueryError::new(e.to_string()))?;
        }

        if let Some(message) = env("fail") {
            return Err(QueryError::new(message).with_backtrace("I am a backtrace"));
        }
        Ok(())
    }
}

/// Build a query with the given id and env settings.
pub fn query(query_id: u64, total: u64, env: &[(&str, &str)]) -> QueryRequest {
    QueryRequest {
        query_id,
        total_queries: total,
        artifact: "Test.Artifact".to_string(),
        sources: vec![fleetflow_protocol::NamedQuery {
            name: format!("Test.Artifact/{}", query_id),
            vql: "SELECT * FROM info()".to_string(),
        }],
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

pub fn flow_request(queries: Vec<QueryRequest>) -> FlowRequest {
    FlowRequest {
        queries,
        // Keep the ticker out of the way unless a test asks for it.
        flow_update_time_ms: 3_600_000,
        log_batch_time_ms: 3_600_000,
        ..Default::default()
    }
}

/// Executor wired to a fresh flow manager and throttler.
pub struct TestClient {
    pub executor: ClientExecutor,
    pub manager: Arc<FlowManager>,
    pub throttler: Arc<Throttler>,
    pub outbound: mpsc::Receiver<Message>,
}

impl TestClient {
    pub fn new() -> Self {
        Self::with_buffer(256)
    }

    pub fn with_buffer(capacity: usize) -> Self {
        let config = ClientConfig::new("C.test").with_output_buffer(capacity);
        let (output, outbound) = mpsc::channel(config.output_buffer);
        let manager = FlowManager::new();
        let throttler = Throttler::new(1);
        let executor = ClientExecutor::new(
            config,
            manager.clone(),
            Arc::new(ScriptedEngine),
            throttler.clone(),
            output,
        );
        Self {
            executor,
            manager,
            throttler,
            outbound,
        }
    }

    pub async fn dispatch(&self, flow_id: &str, request: FlowRequest) {
        self.executor
            .process_request(Message::new(flow_id, Payload::FlowRequest(request)))
            .await
            .unwrap();
    }

    /// Everything currently queued on the output channel.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.outbound.try_recv() {
            messages.push(msg);
        }
        messages
    }

    /// Wait until `flow_id` has `n` registered query scopes.
    pub async fn wait_for_queries(&self, flow_id: &str, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.manager.active_queries(flow_id) < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queries never started");
    }
}

pub fn responses(messages: &[Message]) -> Vec<VqlResponse> {
    messages
        .iter()
        .filter_map(|m| match &m.payload {
            Payload::VqlResponse(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

pub fn stats(messages: &[Message]) -> Vec<FlowStats> {
    messages
        .iter()
        .filter_map(|m| match &m.payload {
            Payload::FlowStats(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

pub fn logs(messages: &[Message]) -> Vec<LogMessage> {
    messages
        .iter()
        .filter_map(|m| match &m.payload {
            Payload::LogMessage(l) => Some(l.clone()),
            _ => None,
        })
        .collect()
}

/// All log lines' messages in order.
pub fn log_lines(messages: &[Message]) -> Vec<String> {
    logs(messages)
        .iter()
        .flat_map(|batch| {
            batch
                .jsonl
                .lines()
                .filter_map(|line| serde_json::from_str::<fleetflow_protocol::LogLine>(line).ok())
                .map(|line| line.message)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Install a test subscriber honouring RUST_LOG. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
