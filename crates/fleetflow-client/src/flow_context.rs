// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-flow execution context on the client.
//!
//! A [`FlowContext`] owns every query running for one flow. Query tasks never
//! share counters: each [`QueryResponder`] keeps its own and sends deltas and
//! status snapshots to a single aggregator task. The aggregator owns the flow
//! totals, the log buffer and the stats clock, and is the only place that
//! writes logs and stats to the output channel.
//!
//! ```text
//!  responder 0 ──┐                           ┌──> LogMessage (batched)
//!  responder 1 ──┼── FlowCommand (unbounded) ─┤
//!  responder N ──┘        aggregator         └──> FlowStats (rate limited)
//!        │
//!        └── VqlResponse / FileBuffer ──> output (bounded, backpressure)
//! ```
//!
//! Teardown order in [`FlowContext::close`]: deregister from the manager,
//! cancel the query scope, wait for every responder to drop, then flush logs
//! and send the final stats. The final report therefore never overtakes a
//! result packet from the same flow.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use fleetflow_protocol::{
    FlowRequest, FlowStats, LEVEL_ALERT, LEVEL_DEFAULT, LEVEL_ERROR, LogLine, LogMessage, Message,
    Payload, QueryRequest, QueryStatus, StatusCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::flow_manager::FlowManager;
use crate::responder::{QueryResponder, ResponderLinks};

/// Flush the log buffer early once it grows past this many bytes.
const MAX_LOG_BUFFER: usize = 512 * 1024;

/// Messages from responders and handles to the aggregator.
#[derive(Debug)]
pub(crate) enum FlowCommand {
    Register { index: usize, status: QueryStatus },
    Status { index: usize, status: QueryStatus },
    ChargeRows(u64),
    ChargeBytes(u64),
    Transactions(i64),
    Log { level: String, message: String },
    Cancel,
    ReportStats,
    Close { done: oneshot::Sender<()> },
}

/// Timing and quota settings for one flow.
#[derive(Debug, Clone, Copy)]
pub struct FlowSettings {
    pub stats_interval: Duration,
    pub batch_delay: Duration,
    /// 0 disables the row quota.
    pub max_rows: u64,
    /// 0 disables the upload quota.
    pub max_upload_bytes: u64,
}

impl FlowSettings {
    pub fn from_request(request: &FlowRequest, config: &crate::config::ClientConfig) -> Self {
        Self {
            stats_interval: config.stats_interval(request),
            batch_delay: config.log_batch_delay(request),
            max_rows: request.max_rows,
            max_upload_bytes: request.max_upload_bytes,
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(5),
            batch_delay: Duration::from_secs(5),
            max_rows: 0,
            max_upload_bytes: 0,
        }
    }
}

struct Inner {
    flow_id: String,
    scope: CancellationToken,
    commands: mpsc::UnboundedSender<FlowCommand>,
    output: mpsc::Sender<Message>,
    tracker: TaskTracker,
    next_index: AtomicUsize,
    upload_ids: Arc<AtomicI64>,
    cancelled: Arc<AtomicBool>,
    closed: AtomicBool,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    owner: Weak<FlowManager>,
}

/// Handle to a running flow. Cheap to clone.
#[derive(Clone)]
pub struct FlowContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("flow_id", &self.inner.flow_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl FlowContext {
    /// Create a flow context and start its aggregator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        flow_id: impl Into<String>,
        settings: FlowSettings,
        output: mpsc::Sender<Message>,
    ) -> Self {
        Self::with_owner(flow_id.into(), settings, output, Weak::new())
    }

    pub(crate) fn with_owner(
        flow_id: String,
        settings: FlowSettings,
        output: mpsc::Sender<Message>,
        owner: Weak<FlowManager>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let scope = CancellationToken::new();
        let cancelled = Arc::new(AtomicBool::new(false));

        let aggregator = Aggregator {
            flow_id: flow_id.clone(),
            settings,
            output: output.clone(),
            scope: scope.clone(),
            cancelled: cancelled.clone(),
            statuses: BTreeMap::new(),
            total_rows: 0,
            total_uploaded_bytes: 0,
            transactions: 0,
            log_buffer: String::new(),
            log_rows: 0,
            log_start_id: 0,
            first_error: None,
            error_pending: false,
            final_stats_sent: false,
            last_stats: Instant::now(),
            output_closed: false,
        };
        let handle = tokio::spawn(aggregator.run(rx));

        Self {
            inner: Arc::new(Inner {
                flow_id,
                scope,
                commands,
                output,
                tracker: TaskTracker::new(),
                next_index: AtomicUsize::new(0),
                upload_ids: Arc::new(AtomicI64::new(0)),
                cancelled,
                closed: AtomicBool::new(false),
                aggregator: Mutex::new(Some(handle)),
                owner,
            }),
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.inner.flow_id
    }

    /// Scope cancelled when the flow is cancelled or closed.
    pub fn scope(&self) -> &CancellationToken {
        &self.inner.scope
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a new query and return its cancellable scope and responder.
    ///
    /// The context cannot finish closing until the responder is dropped.
    pub fn new_responder(&self, query: &QueryRequest) -> (CancellationToken, QueryResponder) {
        let index = self.inner.next_index.fetch_add(1, Ordering::SeqCst);

        let (scope, closer) = match self.inner.owner.upgrade() {
            Some(manager) => {
                let (scope, closer) =
                    manager.new_query_context_under(&self.inner.flow_id, &self.inner.scope);
                (scope, Some(closer))
            }
            None => (self.inner.scope.child_token(), None),
        };

        let status = QueryStatus {
            status: StatusCode::Progress,
            query_id: query.query_id,
            total_queries: query.total_queries,
            artifact: query.artifact.clone(),
            ..Default::default()
        };
        let _ = self.inner.commands.send(FlowCommand::Register {
            index,
            status: status.clone(),
        });

        let responder = QueryResponder::new(
            self.inner.flow_id.clone(),
            index,
            status,
            scope.clone(),
            ResponderLinks {
                commands: self.inner.commands.clone(),
                output: self.inner.output.clone(),
                upload_ids: self.inner.upload_ids.clone(),
                wait_token: self.inner.tracker.token(),
                closer,
            },
        );
        (scope, responder)
    }

    /// Next upload id for this flow.
    pub fn next_upload_id(&self) -> i64 {
        self.inner.upload_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Add a line to the flow log.
    pub fn log(&self, level: &str, message: impl Into<String>) {
        let _ = self.inner.commands.send(FlowCommand::Log {
            level: level.to_string(),
            message: message.into(),
        });
    }

    /// Ask the aggregator for an immediate stats report.
    pub fn report_stats(&self) {
        let _ = self.inner.commands.send(FlowCommand::ReportStats);
    }

    /// Cancel every query of this flow. Only the first call has any effect.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.commands.send(FlowCommand::Cancel);
        self.inner.scope.cancel();
    }

    /// Spawn a task that holds the flow open until it finishes.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    /// Tear the flow down. Blocks until every query has exited.
    ///
    /// Calling close more than once is harmless; only the first call does
    /// the work.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(manager) = self.inner.owner.upgrade() {
            manager.remove_flow_context(&self.inner.flow_id);
        }

        self.inner.scope.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let (done, wait) = oneshot::channel();
        if self.inner.commands.send(FlowCommand::Close { done }).is_ok() {
            let _ = wait.await;
        }

        let handle = self
            .inner
            .aggregator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(flow_id = %self.inner.flow_id, error = %e, "Flow aggregator panicked");
            }
        }

        debug!(flow_id = %self.inner.flow_id, "Flow context closed");
    }
}

// ============================================================================
// Aggregator
// ============================================================================

struct Aggregator {
    flow_id: String,
    settings: FlowSettings,
    output: mpsc::Sender<Message>,
    scope: CancellationToken,
    cancelled: Arc<AtomicBool>,

    statuses: BTreeMap<usize, QueryStatus>,
    total_rows: u64,
    total_uploaded_bytes: u64,
    transactions: i64,

    log_buffer: String,
    log_rows: u64,
    log_start_id: u64,
    first_error: Option<String>,
    error_pending: bool,

    final_stats_sent: bool,
    last_stats: Instant,
    output_closed: bool,
}

impl Aggregator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<FlowCommand>) {
        let delay = self.settings.batch_delay;
        let mut ticker = tokio::time::interval_at(Instant::now() + delay, delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                command = rx.recv() => match command {
                    Some(command) => {
                        if !self.handle(command).await {
                            break;
                        }
                    }
                    None => break,
                },

                _ = ticker.tick() => {
                    self.flush_logs().await;
                    self.maybe_send_stats(false).await;
                }
            }
        }
    }

    /// Apply one command. Returns false once the flow is closed.
    async fn handle(&mut self, command: FlowCommand) -> bool {
        match command {
            FlowCommand::Register { index, status } => {
                self.statuses.insert(index, status);
            }
            FlowCommand::Status { index, status } => self.update_status(index, status),
            FlowCommand::ChargeRows(rows) => {
                self.total_rows += rows;
                let max = self.settings.max_rows;
                if max > 0 && self.total_rows > max {
                    let message = format!(
                        "Rows {} exceeded limit {} for flow {}. Cancelling.",
                        self.total_rows, max, self.flow_id
                    );
                    self.quota_exceeded(message).await;
                }
            }
            FlowCommand::ChargeBytes(bytes) => {
                self.total_uploaded_bytes += bytes;
                let max = self.settings.max_upload_bytes;
                if max > 0 && self.total_uploaded_bytes > max {
                    let message = format!(
                        "Upload bytes {} exceeded limit {} for flow {}. Cancelling.",
                        self.total_uploaded_bytes, max, self.flow_id
                    );
                    self.quota_exceeded(message).await;
                }
            }
            FlowCommand::Transactions(delta) => {
                self.transactions = (self.transactions + delta).max(0);
            }
            FlowCommand::Log { level, message } => self.add_log(&level, message).await,
            FlowCommand::Cancel => self.mark_cancelled(None).await,
            FlowCommand::ReportStats => self.maybe_send_stats(true).await,
            FlowCommand::Close { done } => {
                self.flush_logs().await;
                self.send_final_stats().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    /// The first error is sticky: later snapshots only refresh counters.
    fn update_status(&mut self, index: usize, mut status: QueryStatus) {
        if let Some(existing) = self.statuses.get(&index) {
            if existing.is_error() {
                status.status = existing.status;
                status.error_message = existing.error_message.clone();
                status.backtrace = existing.backtrace.clone();
            }
        }
        self.statuses.insert(index, status);
    }

    async fn quota_exceeded(&mut self, message: String) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        warn!(flow_id = %self.flow_id, "{}", message);
        self.add_log(LEVEL_ERROR, message.clone()).await;
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.mark_cancelled(Some(message)).await;
            self.scope.cancel();
        }
    }

    /// Fail every query still running. The first query carries `reason`.
    async fn mark_cancelled(&mut self, reason: Option<String>) {
        let mut reason = reason;
        for status in self.statuses.values_mut() {
            if let Some(reason) = reason.take() {
                if !status.is_error() {
                    status.status = StatusCode::GenericError;
                    status.error_message = reason;
                }
                continue;
            }
            if !status.is_terminal() {
                status.status = StatusCode::GenericError;
                status.error_message = "Cancelled".to_string();
            }
        }

        let line = format!("Cancelled all inflight queries for flow {}", self.flow_id);
        info!(flow_id = %self.flow_id, "{}", line);
        self.add_log(LEVEL_ERROR, line).await;
    }

    async fn add_log(&mut self, level: &str, message: String) {
        let line = LogLine {
            client_time: chrono::Utc::now().timestamp().max(0) as u64,
            level: level.to_string(),
            message,
        };

        if level == LEVEL_ALERT {
            // Alerts bypass batching but must keep the id sequence intact.
            self.flush_logs().await;
            let alert = LogMessage {
                id: self.log_start_id,
                number_of_rows: 1,
                jsonl: line.to_jsonl(),
                level: LEVEL_ALERT.to_string(),
                ..Default::default()
            };
            self.log_start_id += 1;
            self.send(Payload::LogMessage(alert)).await;
            return;
        }

        if level == LEVEL_ERROR && self.first_error.is_none() {
            self.first_error = Some(line.message.clone());
            self.error_pending = true;
        }

        self.log_buffer.push_str(&line.to_jsonl());
        self.log_rows += 1;

        if self.log_buffer.len() > MAX_LOG_BUFFER {
            self.flush_logs().await;
        }
    }

    async fn flush_logs(&mut self) {
        if self.log_rows == 0 {
            return;
        }

        let error_message = if self.error_pending {
            self.error_pending = false;
            self.first_error.clone().unwrap_or_default()
        } else {
            String::new()
        };

        let batch = LogMessage {
            id: self.log_start_id,
            number_of_rows: self.log_rows,
            jsonl: std::mem::take(&mut self.log_buffer),
            error_message,
            level: LEVEL_DEFAULT.to_string(),
            ..Default::default()
        };
        self.log_start_id += self.log_rows;
        self.log_rows = 0;

        self.send(Payload::LogMessage(batch)).await;
    }

    fn is_complete(&self) -> bool {
        !self.statuses.is_empty() && self.statuses.values().all(QueryStatus::is_terminal)
    }

    fn build_stats(&self, flow_complete: bool) -> FlowStats {
        let statuses: Vec<QueryStatus> = self.statuses.values().cloned().collect();
        FlowStats {
            total_uploaded_files: statuses.iter().map(|s| s.uploaded_files).sum(),
            total_expected_uploaded_bytes: statuses.iter().map(|s| s.expected_uploaded_bytes).sum(),
            query_status: statuses,
            flow_complete,
            total_collected_rows: self.total_rows,
            total_uploaded_bytes: self.total_uploaded_bytes,
            total_logs: self.log_start_id + self.log_rows,
            transactions_outstanding: self.transactions.max(0) as u64,
            timestamp: now_micros(),
        }
    }

    /// Send stats when the interval elapsed, the flow completed or `force`.
    async fn maybe_send_stats(&mut self, force: bool) {
        if self.final_stats_sent {
            return;
        }
        let complete = self.is_complete();
        if !(force || complete || self.last_stats.elapsed() >= self.settings.stats_interval) {
            return;
        }

        let stats = self.build_stats(complete);
        if complete {
            self.final_stats_sent = true;
        }
        self.last_stats = Instant::now();
        self.send(Payload::FlowStats(stats)).await;
    }

    async fn send_final_stats(&mut self) {
        if self.final_stats_sent {
            return;
        }
        self.final_stats_sent = true;
        // Every responder has dropped by now, so the flow is over.
        let stats = self.build_stats(true);
        self.send(Payload::FlowStats(stats)).await;
    }

    async fn send(&mut self, payload: Payload) {
        if self.output_closed {
            return;
        }
        let message = Message::new(self.flow_id.clone(), payload);
        if self.output.send(message).await.is_err() {
            debug!(flow_id = %self.flow_id, "Output channel closed, dropping flow messages");
            self.output_closed = true;
        }
    }
}

pub(crate) fn now_micros() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}
