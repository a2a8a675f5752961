// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingestion of client message batches.
//!
//! A [`FlowRunner`] handles one POST worth of messages from one client. Rows
//! and log lines are written in order as they arrive. Side writes that do not
//! affect later messages (upload metadata, transaction rows, sparse indexes)
//! run on a task tracker, and [`FlowRunner::close`] waits for them before
//! publishing the flow completions gathered along the way. A completion event
//! therefore never precedes the data it summarizes.

use std::sync::Arc;

use chrono::Utc;
use fleetflow_protocol::{
    Cancel, FileBuffer, FlowStats, LEVEL_ALERT, LogLine, LogMessage, MONITORING_FLOW_ID, Message,
    Payload, UploadTransaction, VqlResponse,
};
use serde_json::{Value, json};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::client_info::ClientInfoManager;
use crate::collection_context::reduce;
use crate::error::Result;
use crate::flow_store::FlowStore;
use crate::journal::{ALERTS_QUEUE, FLOW_COMPLETION_QUEUE, Journal, UPLOAD_COMPLETION_QUEUE};
use crate::obfuscation::Obfuscator;
use crate::paths::{FlowPathManager, split_query_name};
use crate::result_sets::{ResultSetError, ResultSetWriter, WriteMode};
use crate::storage::{FileStore, StorePath};

/// Principal named in cancellations the server issues itself.
pub const SERVER_PRINCIPAL: &str = "fleetflow-server";

/// Shared services a runner writes through.
#[derive(Clone)]
pub struct RunnerDeps {
    pub flow_store: Arc<FlowStore>,
    pub journal: Arc<dyn Journal>,
    pub client_info: Arc<ClientInfoManager>,
    pub obfuscator: Obfuscator,
}

impl std::fmt::Debug for RunnerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerDeps")
            .field("flow_store", &self.flow_store)
            .field("journal", &"...")
            .field("obfuscator", &self.obfuscator)
            .finish()
    }
}

pub struct FlowRunner {
    deps: RunnerDeps,
    files: Arc<dyn FileStore>,
    client_id: String,
    tracker: TaskTracker,
    completions: Vec<Value>,
    upload_completions: Vec<Value>,
}

impl std::fmt::Debug for FlowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRunner")
            .field("client_id", &self.client_id)
            .field("pending_tasks", &self.tracker.len())
            .field("completions", &self.completions.len())
            .field("upload_completions", &self.upload_completions.len())
            .finish()
    }
}

impl FlowRunner {
    pub fn new(deps: RunnerDeps, client_id: impl Into<String>) -> Self {
        let files = deps.flow_store.file_store();
        Self {
            deps,
            files,
            client_id: client_id.into(),
            tracker: TaskTracker::new(),
            completions: Vec::new(),
            upload_completions: Vec::new(),
        }
    }

    /// Process every message in order.
    ///
    /// Stops at the first fatal error; other errors are logged and skipped.
    /// Call [`close`](Self::close) afterwards either way.
    pub async fn process_batch(&mut self, messages: Vec<Message>) -> Result<()> {
        for message in &messages {
            if let Err(e) = self.process_message(message).await {
                if e.is_fatal() {
                    warn!(
                        client_id = %self.client_id,
                        flow_id = %message.session_id,
                        error = %e,
                        code = e.error_code(),
                        "Aborting batch"
                    );
                    return Err(e);
                }
                warn!(
                    client_id = %self.client_id,
                    flow_id = %message.session_id,
                    error = %e,
                    "Failed to process message"
                );
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(client_id = %self.client_id, flow_id = %message.session_id))]
    pub async fn process_message(&mut self, message: &Message) -> Result<()> {
        let flow_id = message.session_id.as_str();
        if flow_id == MONITORING_FLOW_ID {
            return self.process_monitoring(message).await;
        }

        self.deps
            .client_info
            .flow_activity(&self.client_id, flow_id, Utc::now());

        match &message.payload {
            Payload::VqlResponse(response) => self.vql_response(flow_id, response).await,
            Payload::LogMessage(log) => self.log_message(flow_id, log).await,
            Payload::FlowStats(stats) => self.flow_stats(flow_id, stats).await,
            Payload::FileBuffer(buffer) => self.file_buffer(flow_id, buffer).await,
            Payload::UploadTransaction(transaction) => {
                self.upload_transaction(flow_id, transaction);
                Ok(())
            }
            other => {
                debug!(kind = ?other.kind(), "Ignoring server-bound message kind");
                Ok(())
            }
        }
    }

    /// Wait for side writes, then publish completions.
    pub async fn close(self) {
        self.tracker.close();
        self.tracker.wait().await;

        let queues = [
            (UPLOAD_COMPLETION_QUEUE, self.upload_completions),
            (FLOW_COMPLETION_QUEUE, self.completions),
        ];
        for (queue, rows) in queues {
            if rows.is_empty() {
                continue;
            }
            if let Err(e) = self.deps.journal.push_rows(queue, rows).await {
                warn!(client_id = %self.client_id, queue, error = %e, "Failed to publish completions");
            }
        }
    }

    /// Query name in the clear, or None for names that must not be stored.
    fn query_name(&self, name: &str) -> Option<String> {
        let name = self.deps.obfuscator.deobfuscate(name);
        if name.is_empty() || name.starts_with('$') {
            debug!(name = %name, "Dropping response for internal query");
            return None;
        }
        Some(name)
    }

    fn request_cancel(&self, flow_id: &str, reason: &str) {
        warn!(client_id = %self.client_id, flow_id, reason, "Cancelling flow");
        let client_info = &self.deps.client_info;
        client_info.remove_tasks_for_flow(&self.client_id, flow_id);
        client_info.queue_message(
            &self.client_id,
            Message::new(flow_id, Payload::Cancel(Cancel::by(SERVER_PRINCIPAL))).urgent(),
        );
    }

    async fn vql_response(&mut self, flow_id: &str, response: &VqlResponse) -> Result<()> {
        let Some(name) = self.query_name(&response.query.name) else {
            return Ok(());
        };
        let jsonl = match response.jsonl() {
            Ok(jsonl) => self.deps.obfuscator.deobfuscate_text(&jsonl),
            Err(e) => {
                warn!(query = %name, error = %e, "Undecodable response payload");
                return Ok(());
            }
        };

        // Held from the retransmission check until the rows are charged.
        let flow_store = self.deps.flow_store.clone();
        let flow = flow_store.lock(&self.client_id, flow_id).await;

        let path = FlowPathManager::new(&self.client_id, flow_id).artifact(&name);
        let mut writer = ResultSetWriter::open(self.files.clone(), &path, WriteMode::Append).await?;

        // Only packets that claim a position are checked: a retransmitted
        // packet claims rows that are already committed.
        if response.query_start_row > 0 || response.part == 0 {
            match writer.set_start_row(response.query_start_row) {
                Ok(()) => {}
                Err(ResultSetError::Rewind { requested, committed }) => {
                    debug!(query = %name, requested, committed, "Dropping retransmitted rows");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        let rows = writer.write_jsonl(&jsonl).await?;
        writer.close();

        let (_, cancel) = flow
            .modify(|ctx| {
                if !ctx.artifacts_with_results.contains(&name) {
                    ctx.artifacts_with_results.push(name.clone());
                    ctx.artifacts_with_results.sort();
                }
                ctx.charge_rows(rows)
            })
            .await?;
        drop(flow);
        if let Some(reason) = cancel {
            self.request_cancel(flow_id, &reason);
        }
        Ok(())
    }

    async fn log_message(&mut self, flow_id: &str, log: &LogMessage) -> Result<()> {
        let flow_store = self.deps.flow_store.clone();
        let flow = flow_store.lock(&self.client_id, flow_id).await;

        let path = FlowPathManager::new(&self.client_id, flow_id).log();
        let mut writer = ResultSetWriter::open(self.files.clone(), &path, WriteMode::Append).await?;
        match writer.set_start_row(log.id) {
            Ok(()) => {}
            Err(ResultSetError::Rewind { requested, committed }) => {
                debug!(requested, committed, "Dropping retransmitted log batch");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let text = self.deps.obfuscator.deobfuscate_text(&log.jsonl);
        let rows = writer.write_jsonl(&text).await?;
        writer.close();

        let error = self.deps.obfuscator.deobfuscate_text(&log.error_message);
        flow.modify(|ctx| {
            ctx.total_logs += rows;
            ctx.record_log_error(&error);
        })
        .await?;
        drop(flow);

        self.publish_alerts(flow_id, &text).await;
        Ok(())
    }

    async fn publish_alerts(&self, flow_id: &str, text: &str) {
        let alerts: Vec<Value> = text
            .lines()
            .filter_map(|line| serde_json::from_str::<LogLine>(line).ok())
            .filter(|line| line.level == LEVEL_ALERT)
            .map(|line| {
                json!({
                    "ClientId": self.client_id,
                    "FlowId": flow_id,
                    "Timestamp": line.client_time,
                    "Message": line.message,
                })
            })
            .collect();
        if alerts.is_empty() {
            return;
        }
        if let Err(e) = self.deps.journal.push_rows(ALERTS_QUEUE, alerts).await {
            warn!(error = %e, "Failed to publish alerts");
        }
    }

    async fn flow_stats(&mut self, flow_id: &str, stats: &FlowStats) -> Result<()> {
        let mut stats = stats.clone();
        for status in &mut stats.query_status {
            status.artifact = self.deps.obfuscator.deobfuscate(&status.artifact);
            for name in &mut status.names_with_response {
                *name = self.deps.obfuscator.deobfuscate(name);
            }
            status.error_message = self.deps.obfuscator.deobfuscate_text(&status.error_message);
        }

        let now = Utc::now();
        let (ctx, outcome) = self
            .deps
            .flow_store
            .modify(&self.client_id, flow_id, |ctx| reduce(ctx, &stats, now))
            .await?;

        if let Some(reason) = &outcome.cancel {
            self.request_cancel(flow_id, reason);
        }
        if outcome.newly_complete {
            info!(
                state = ?ctx.state,
                rows = ctx.total_collected_rows,
                uploaded_bytes = ctx.total_uploaded_bytes,
                "Flow completed"
            );
            self.deps.client_info.flow_completed(&self.client_id, flow_id);
            self.completions.push(json!({
                "Timestamp": now.timestamp(),
                "ClientId": self.client_id,
                "FlowId": flow_id,
                "Flow": serde_json::to_value(&ctx)?,
            }));
        }
        Ok(())
    }

    async fn file_buffer(&mut self, flow_id: &str, buffer: &FileBuffer) -> Result<()> {
        let paths = FlowPathManager::new(&self.client_id, flow_id);
        let components = upload_components(buffer);
        let file = paths.upload_file(&buffer.pathspec.accessor, &components);

        let written = match self.write_upload(&file, buffer).await {
            Ok(()) => buffer.data.len() as u64,
            Err(e) => {
                // One bad upload must not fail the rest of the batch.
                warn!(path = %file, error = %e, "Failed to write upload");
                return Ok(());
            }
        };

        if buffer.offset == 0 {
            let row = json!({
                "Timestamp": Utc::now().timestamp(),
                "started": Utc::now().to_rfc3339(),
                "vfs_path": file.to_string(),
                "accessor": buffer.pathspec.accessor,
                "components": components,
                "file_size": buffer.size,
                "upload_id": buffer.upload_number,
            });
            self.spawn_row(paths.upload_metadata(), row);
        }

        let first = buffer.offset == 0;
        let (_, cancel) = self
            .deps
            .flow_store
            .modify(&self.client_id, flow_id, |ctx| {
                if first {
                    ctx.total_uploaded_files += 1;
                }
                ctx.charge_upload_bytes(written)
            })
            .await?;
        if let Some(reason) = cancel {
            self.request_cancel(flow_id, &reason);
        }

        if buffer.eof {
            self.finish_upload(flow_id, file, buffer);
        }
        Ok(())
    }

    async fn write_upload(
        &self,
        file: &StorePath,
        buffer: &FileBuffer,
    ) -> std::result::Result<(), crate::error::StorageError> {
        if buffer.offset == 0 {
            self.files.truncate(file).await?;
        }
        if !buffer.data.is_empty() {
            self.files.write_at(file, buffer.offset, &buffer.data).await?;
        }
        Ok(())
    }

    fn finish_upload(&mut self, flow_id: &str, file: StorePath, buffer: &FileBuffer) {
        self.upload_completions.push(json!({
            "Timestamp": Utc::now().timestamp(),
            "ClientId": self.client_id,
            "FlowId": flow_id,
            "VfsPath": file.to_string(),
            "Size": buffer.size,
            "UploadedSize": buffer.stored_size,
            "UploadId": buffer.upload_number,
        }));

        let Some(index) = buffer.index.clone() else {
            return;
        };
        let files = self.files.clone();
        self.tracker.spawn(async move {
            let index_path = FlowPathManager::upload_index(&file);
            let written = match serde_json::to_vec(&index) {
                Ok(data) => files.write_at(&index_path, 0, &data).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = written {
                warn!(path = %index_path, error = %e, "Failed to write upload index");
            }
        });
    }

    fn upload_transaction(&self, flow_id: &str, transaction: &UploadTransaction) {
        let path = FlowPathManager::new(&self.client_id, flow_id).upload_transactions();
        match serde_json::to_value(transaction) {
            Ok(row) => self.spawn_row(path, row),
            Err(e) => warn!(error = %e, "Cannot encode upload transaction"),
        }
    }

    /// Append one row to a result set in the background.
    fn spawn_row(&self, path: StorePath, row: Value) {
        let files = self.files.clone();
        self.tracker.spawn(async move {
            let written = async {
                let mut writer = ResultSetWriter::open(files, &path, WriteMode::Append).await?;
                writer.write_row(&row).await
            };
            if let Err(e) = written.await {
                warn!(path = %path, error = %e, "Failed to write row");
            }
        });
    }

    async fn process_monitoring(&mut self, message: &Message) -> Result<()> {
        match &message.payload {
            Payload::VqlResponse(response) => {
                let Some(name) = self.query_name(&response.query.name) else {
                    return Ok(());
                };
                let jsonl = match response.jsonl() {
                    Ok(jsonl) => self.deps.obfuscator.deobfuscate_text(&jsonl),
                    Err(e) => {
                        warn!(query = %name, error = %e, "Undecodable monitoring payload");
                        return Ok(());
                    }
                };

                let path = FlowPathManager::monitoring(&self.client_id, &name);
                let mut writer =
                    ResultSetWriter::open(self.files.clone(), &path, WriteMode::Append).await?;
                writer.write_jsonl(&jsonl).await?;

                let rows: Vec<Value> = jsonl
                    .lines()
                    .filter_map(|line| serde_json::from_str::<Value>(line).ok())
                    .map(|mut row| {
                        if let Value::Object(map) = &mut row {
                            map.insert("ClientId".into(), Value::String(self.client_id.clone()));
                        }
                        row
                    })
                    .collect();
                let (artifact, _) = split_query_name(&name);
                if let Err(e) = self.deps.journal.push_rows(artifact, rows).await {
                    warn!(artifact, error = %e, "Failed to publish monitoring rows");
                }
                Ok(())
            }
            Payload::LogMessage(log) => {
                let path = FlowPathManager::monitoring_log(&self.client_id);
                let mut writer =
                    ResultSetWriter::open(self.files.clone(), &path, WriteMode::Append).await?;
                let text = self.deps.obfuscator.deobfuscate_text(&log.jsonl);
                writer.write_jsonl(&text).await?;
                self.publish_alerts(MONITORING_FLOW_ID, &text).await;
                Ok(())
            }
            other => {
                debug!(kind = ?other.kind(), "Ignoring monitoring message");
                Ok(())
            }
        }
    }
}

/// Path components of an upload, falling back to splitting its path.
fn upload_components(buffer: &FileBuffer) -> Vec<String> {
    if !buffer.pathspec.components.is_empty() {
        return buffer.pathspec.components.clone();
    }
    buffer
        .pathspec
        .path
        .split(['/', '\\'])
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}
