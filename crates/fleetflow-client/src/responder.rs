// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-query handle used by the query engine to emit results.
//!
//! A [`QueryResponder`] owns its query's counters. Result rows and file
//! chunks go straight to the output channel, which is where backpressure
//! from the transport is felt. Counter deltas and status snapshots go to the
//! flow aggregator, which never blocks the query.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use fleetflow_protocol::{
    FileBuffer, Message, NamedQuery, Payload, QueryStatus, StatusCode, UploadTransaction,
    VqlResponse,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::flow_context::{FlowCommand, now_micros};
use crate::flow_manager::QueryCloser;

/// Status reported for a query dropped without `return_ok` or `raise_error`.
pub const QUERY_EXITED_MESSAGE: &str = "Query exited without reporting a status";

/// Channels and guards tying a responder to its flow.
pub(crate) struct ResponderLinks {
    pub commands: mpsc::UnboundedSender<FlowCommand>,
    pub output: mpsc::Sender<Message>,
    pub upload_ids: Arc<AtomicI64>,
    pub wait_token: TaskTrackerToken,
    pub closer: Option<QueryCloser>,
}

/// Row offset and packet counter for one named source.
#[derive(Debug, Default, Clone, Copy)]
struct SourceCursor {
    next_row: u64,
    part: u64,
}

/// Execution handle for exactly one query of a flow.
pub struct QueryResponder {
    flow_id: String,
    index: usize,
    status: QueryStatus,
    scope: CancellationToken,
    links: ResponderLinks,
    cursors: BTreeMap<String, SourceCursor>,
    started: Instant,
    terminal: bool,
}

impl std::fmt::Debug for QueryResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResponder")
            .field("flow_id", &self.flow_id)
            .field("query_id", &self.status.query_id)
            .field("status", &self.status.status)
            .finish()
    }
}

impl QueryResponder {
    pub(crate) fn new(
        flow_id: String,
        index: usize,
        mut status: QueryStatus,
        scope: CancellationToken,
        links: ResponderLinks,
    ) -> Self {
        let now = now_micros();
        status.first_active = now;
        status.last_active = now;
        Self {
            flow_id,
            index,
            status,
            scope,
            links,
            cursors: BTreeMap::new(),
            started: Instant::now(),
            terminal: false,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn query_id(&self) -> u64 {
        self.status.query_id
    }

    /// Cancellation scope of this query.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Snapshot of the local status.
    pub fn status(&self) -> &QueryStatus {
        &self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Send `rows` JSONL rows produced by the named source.
    ///
    /// The packet carries the row offset of its first row so the server can
    /// drop retransmissions. Rows are charged against the flow quota after
    /// the packet is handed to the output.
    pub async fn add_response(&mut self, name: &str, jsonl: String, rows: u64) -> Result<()> {
        let cursor = self.cursors.get(name).copied().unwrap_or_default();
        let response = VqlResponse {
            query: NamedQuery {
                name: name.to_string(),
                vql: String::new(),
            },
            query_id: self.status.query_id,
            jsonl_response: jsonl,
            total_rows: rows,
            query_start_row: cursor.next_row,
            part: cursor.part,
            timestamp: now_micros(),
            ..Default::default()
        };
        self.send(Payload::VqlResponse(response)).await?;

        self.cursors.insert(
            name.to_string(),
            SourceCursor {
                next_row: cursor.next_row + rows,
                part: cursor.part + 1,
            },
        );
        self.status.result_rows += rows;
        if !self.status.names_with_response.iter().any(|n| n == name) {
            self.status.names_with_response.push(name.to_string());
        }

        self.command(FlowCommand::ChargeRows(rows));
        self.report_progress();
        Ok(())
    }

    /// Send one chunk of an uploaded file.
    pub async fn upload_buffer(&mut self, buffer: FileBuffer) -> Result<()> {
        let bytes = buffer.data.len() as u64;
        let first_chunk = buffer.offset == 0;
        let stored_size = buffer.stored_size;
        let eof = buffer.eof;

        self.send(Payload::FileBuffer(buffer)).await?;

        self.status.uploaded_bytes += bytes;
        if first_chunk {
            self.status.uploaded_files += 1;
            self.status.expected_uploaded_bytes += stored_size;
        }
        self.command(FlowCommand::ChargeBytes(bytes));
        if eof {
            self.command(FlowCommand::Transactions(-1));
        }
        self.report_progress();
        Ok(())
    }

    /// Record the start of a resumable upload.
    pub async fn upload_transaction(&mut self, transaction: UploadTransaction) -> Result<()> {
        self.send(Payload::UploadTransaction(transaction)).await?;
        self.command(FlowCommand::Transactions(1));
        Ok(())
    }

    /// Next upload id of the flow.
    pub fn next_upload_id(&self) -> i64 {
        self.links.upload_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Add a line to the flow log.
    pub fn log(&mut self, level: &str, message: impl Into<String>) {
        self.status.log_rows += 1;
        self.command(FlowCommand::Log {
            level: level.to_string(),
            message: message.into(),
        });
    }

    /// Mark the query as finished successfully. Ignored once terminal.
    pub fn return_ok(&mut self) {
        if self.terminal {
            return;
        }
        self.status.status = StatusCode::Ok;
        self.finish();
    }

    /// Mark the query as failed. Ignored once terminal.
    pub fn raise_error(&mut self, message: impl Into<String>, backtrace: impl Into<String>) {
        if self.terminal {
            return;
        }
        self.status.status = StatusCode::GenericError;
        self.status.error_message = message.into();
        self.status.backtrace = backtrace.into();
        self.finish();
    }

    fn finish(&mut self) {
        self.terminal = true;
        self.report_progress();
        debug!(
            flow_id = %self.flow_id,
            query_id = self.status.query_id,
            status = ?self.status.status,
            "Query finished"
        );
    }

    fn report_progress(&mut self) {
        self.status.duration_ns = self.started.elapsed().as_nanos() as u64;
        self.status.last_active = now_micros();
        self.command(FlowCommand::Status {
            index: self.index,
            status: self.status.clone(),
        });
    }

    fn command(&self, command: FlowCommand) {
        // The aggregator outlives every responder unless the flow was torn
        // down abnormally, in which case there is nobody left to count.
        let _ = self.links.commands.send(command);
    }

    async fn send(&self, payload: Payload) -> Result<()> {
        let message =
            Message::new(self.flow_id.clone(), payload).with_request_id(self.status.query_id);
        tokio::select! {
            biased;

            _ = self.scope.cancelled() => Err(FlowError::Cancelled),

            sent = self.links.output.send(message) => sent.map_err(|_| FlowError::OutputClosed),
        }
    }
}

impl Drop for QueryResponder {
    fn drop(&mut self) {
        if !self.terminal {
            self.status.status = StatusCode::GenericError;
            self.status.error_message = QUERY_EXITED_MESSAGE.to_string();
            self.terminal = true;
            self.report_progress();
        }
        if let Some(closer) = self.links.closer.take() {
            closer.close();
        }
    }
}
