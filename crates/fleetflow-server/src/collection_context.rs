// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The server's authoritative record of a flow.
//!
//! A [`CollectionContext`] is rebuilt from the per-query status reports a
//! client sends. [`reduce`] folds one [`FlowStats`] report into the record;
//! it is pure, so the order-independence rules live in one place:
//!
//! - statuses merge by query id, and an error status is never replaced;
//! - counters only grow (the larger of the server count and the client report);
//! - the final transition happens once, after which statuses and state freeze.

use chrono::{DateTime, Utc};
use fleetflow_protocol::{FlowRequest, FlowStats, QueryStatus, StatusCode, UNKNOWN_FLOW_MESSAGE};
use serde::{Deserialize, Serialize};

/// Overall state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    /// Scheduled, not yet handed to the client.
    #[default]
    Running,
    /// Handed to the client, no report yet.
    Waiting,
    /// The client reported queries still running.
    InProgress,
    /// No activity for longer than the unresponsive timeout.
    Unresponsive,
    Finished,
    Error,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    /// States the in-flight monitor may move to UNRESPONSIVE.
    pub fn is_awaiting_client(self) -> bool {
        matches!(self, Self::Running | Self::Waiting | Self::InProgress)
    }
}

/// What the server remembers about the original request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSummary {
    pub artifacts: Vec<String>,
    pub creator: String,
    pub timeout_secs: u64,
    pub cpu_limit: f64,
    pub iops_limit: f64,
}

impl From<&FlowRequest> for RequestSummary {
    fn from(request: &FlowRequest) -> Self {
        let mut artifacts: Vec<String> = request.queries.iter().map(|q| q.artifact.clone()).collect();
        artifacts.sort();
        artifacts.dedup();
        Self {
            artifacts,
            creator: request.creator.clone(),
            timeout_secs: request.timeout_secs,
            cpu_limit: request.cpu_limit,
            iops_limit: request.iops_limit,
        }
    }
}

/// Durable record of one (client, flow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionContext {
    pub client_id: String,
    pub session_id: String,
    pub request: RequestSummary,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub active_time: Option<DateTime<Utc>>,

    pub state: FlowState,
    pub status: String,
    pub backtrace: String,
    pub query_stats: Vec<QueryStatus>,

    pub total_requests: u64,
    pub outstanding_requests: u64,
    pub artifacts_with_results: Vec<String>,

    pub total_collected_rows: u64,
    pub total_uploaded_files: u64,
    pub total_uploaded_bytes: u64,
    pub total_expected_uploaded_bytes: u64,
    pub total_logs: u64,
    /// Sum of query durations in nanoseconds. Exceeds wall time when queries
    /// run in parallel.
    pub execution_duration: u64,
    pub transactions_outstanding: u64,

    /// 0 disables the row quota.
    pub max_rows: u64,
    /// 0 disables the upload quota.
    pub max_upload_bytes: u64,

    /// First error reported in a log batch.
    pub log_error: String,
    pub completion_sent: bool,
    pub cancel_requested: bool,
}

impl Default for CollectionContext {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            session_id: String::new(),
            request: RequestSummary::default(),
            create_time: Utc::now(),
            start_time: None,
            active_time: None,
            state: FlowState::Running,
            status: String::new(),
            backtrace: String::new(),
            query_stats: Vec::new(),
            total_requests: 0,
            outstanding_requests: 0,
            artifacts_with_results: Vec::new(),
            total_collected_rows: 0,
            total_uploaded_files: 0,
            total_uploaded_bytes: 0,
            total_expected_uploaded_bytes: 0,
            total_logs: 0,
            execution_duration: 0,
            transactions_outstanding: 0,
            max_rows: 0,
            max_upload_bytes: 0,
            log_error: String::new(),
            completion_sent: false,
            cancel_requested: false,
        }
    }
}

/// Effects the caller must carry out after a reduction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReduceOutcome {
    /// The flow breached a quota; send a cancel to the client.
    pub cancel: Option<String>,
    /// The flow reached its final state with this report.
    pub newly_complete: bool,
}

impl CollectionContext {
    /// An empty RUNNING record.
    pub fn new(client_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// A RUNNING record for a freshly scheduled request.
    pub fn for_request(
        client_id: impl Into<String>,
        session_id: impl Into<String>,
        request: &FlowRequest,
    ) -> Self {
        Self {
            request: RequestSummary::from(request),
            total_requests: request.queries.len() as u64,
            outstanding_requests: request.queries.len() as u64,
            max_rows: request.max_rows,
            max_upload_bytes: request.max_upload_bytes,
            ..Self::new(client_id, session_id)
        }
    }

    /// Count rows committed by the server. Returns a cancel reason on a
    /// fresh quota breach.
    pub fn charge_rows(&mut self, rows: u64) -> Option<String> {
        self.total_collected_rows += rows;
        self.check_quotas()
    }

    /// Count upload bytes committed by the server.
    pub fn charge_upload_bytes(&mut self, bytes: u64) -> Option<String> {
        self.total_uploaded_bytes += bytes;
        self.check_quotas()
    }

    /// Remember the first error seen in the flow log.
    pub fn record_log_error(&mut self, message: &str) {
        if self.log_error.is_empty() && !message.is_empty() {
            self.log_error = message.to_string();
        }
    }

    /// Cancel on behalf of a user. Returns false if the flow already ended.
    pub fn cancel(&mut self, principal: &str) -> bool {
        if self.completion_sent || self.state == FlowState::Finished {
            return false;
        }
        let reason = format!("Cancelled by {}", principal);
        for status in &mut self.query_stats {
            if !status.is_terminal() {
                status.status = StatusCode::GenericError;
                status.error_message = reason.clone();
            }
        }
        self.state = FlowState::Error;
        self.status = reason;
        self.backtrace.clear();
        self.cancel_requested = true;
        true
    }

    /// Mark as UNRESPONSIVE if still waiting on the client.
    pub fn mark_unresponsive(&mut self) -> bool {
        if self.completion_sent || !self.state.is_awaiting_client() {
            return false;
        }
        self.state = FlowState::Unresponsive;
        true
    }

    fn check_quotas(&mut self) -> Option<String> {
        if self.cancel_requested || self.completion_sent {
            return None;
        }
        let reason = if self.max_rows > 0 && self.total_collected_rows > self.max_rows {
            format!("Row count exceeded limit {}", self.max_rows)
        } else if self.max_upload_bytes > 0 && self.total_uploaded_bytes > self.max_upload_bytes {
            format!("Upload bytes exceeded limit {}", self.max_upload_bytes)
        } else {
            return None;
        };

        self.cancel_requested = true;
        self.state = FlowState::Error;
        self.status = reason.clone();
        self.backtrace.clear();
        Some(reason)
    }

    fn merge_status(&mut self, incoming: &QueryStatus) {
        let Some(existing) = self
            .query_stats
            .iter_mut()
            .find(|s| s.query_id == incoming.query_id)
        else {
            self.query_stats.push(incoming.clone());
            return;
        };

        let sticky = existing.is_error();
        let mut names = existing.names_with_response.clone();
        names.extend(incoming.names_with_response.iter().cloned());
        names.sort();
        names.dedup();

        let merged = QueryStatus {
            names_with_response: names,
            duration_ns: existing.duration_ns.max(incoming.duration_ns),
            result_rows: existing.result_rows.max(incoming.result_rows),
            log_rows: existing.log_rows.max(incoming.log_rows),
            uploaded_files: existing.uploaded_files.max(incoming.uploaded_files),
            uploaded_bytes: existing.uploaded_bytes.max(incoming.uploaded_bytes),
            expected_uploaded_bytes: existing
                .expected_uploaded_bytes
                .max(incoming.expected_uploaded_bytes),
            first_active: match (existing.first_active, incoming.first_active) {
                (0, b) => b,
                (a, 0) => a,
                (a, b) => a.min(b),
            },
            last_active: existing.last_active.max(incoming.last_active),
            ..incoming.clone()
        };

        let (status, error_message, backtrace) = if sticky {
            (
                existing.status,
                existing.error_message.clone(),
                existing.backtrace.clone(),
            )
        } else {
            (merged.status, merged.error_message.clone(), merged.backtrace.clone())
        };
        *existing = QueryStatus {
            status,
            error_message,
            backtrace,
            ..merged
        };
    }

    /// The client no longer knows the flow: nothing still open will finish.
    fn fail_open_queries(&mut self, report: &QueryStatus) {
        let mut marked = false;
        for status in &mut self.query_stats {
            if status.status == StatusCode::Progress {
                status.status = StatusCode::GenericError;
                status.error_message = UNKNOWN_FLOW_MESSAGE.to_string();
                marked = true;
            }
        }
        if !marked && !self.query_stats.iter().any(QueryStatus::is_error) {
            self.merge_status(&QueryStatus {
                status: StatusCode::GenericError,
                error_message: UNKNOWN_FLOW_MESSAGE.to_string(),
                ..report.clone()
            });
        }
    }

    fn recompute_state(&mut self, complete: bool, reported_progress: bool) {
        if self.cancel_requested {
            self.state = FlowState::Error;
            return;
        }

        // First error in query id order wins.
        if let Some(failed) = self.query_stats.iter().find(|s| s.is_error()) {
            self.state = FlowState::Error;
            self.status = failed.error_message.clone();
            self.backtrace = failed.backtrace.clone();
            return;
        }

        if complete {
            if self.log_error.is_empty() {
                self.state = FlowState::Finished;
            } else {
                self.state = FlowState::Error;
                self.status = self.log_error.clone();
            }
            return;
        }

        if reported_progress || self.state == FlowState::Unresponsive {
            self.state = FlowState::InProgress;
        }
    }
}

/// Fold one status report into `ctx`.
pub fn reduce(ctx: &mut CollectionContext, stats: &FlowStats, now: DateTime<Utc>) -> ReduceOutcome {
    let mut outcome = ReduceOutcome::default();

    ctx.start_time.get_or_insert(now);
    ctx.active_time = Some(now);

    ctx.total_collected_rows = ctx.total_collected_rows.max(stats.total_collected_rows);
    ctx.total_uploaded_files = ctx.total_uploaded_files.max(stats.total_uploaded_files);
    ctx.total_uploaded_bytes = ctx.total_uploaded_bytes.max(stats.total_uploaded_bytes);
    ctx.total_expected_uploaded_bytes = ctx
        .total_expected_uploaded_bytes
        .max(stats.total_expected_uploaded_bytes);
    ctx.total_logs = ctx.total_logs.max(stats.total_logs);
    ctx.transactions_outstanding = stats.transactions_outstanding;

    if ctx.completion_sent {
        // Late reports still count, but the outcome is settled.
        return outcome;
    }

    let mut reported_progress = false;
    for status in &stats.query_status {
        if status.status == StatusCode::UnknownFlow {
            ctx.fail_open_queries(status);
            continue;
        }
        reported_progress |= status.status == StatusCode::Progress;
        ctx.merge_status(status);
    }
    ctx.query_stats.sort_by_key(|s| s.query_id);

    let mut artifacts: Vec<String> = ctx
        .query_stats
        .iter()
        .flat_map(|s| s.names_with_response.iter().cloned())
        .chain(ctx.artifacts_with_results.drain(..))
        .collect();
    artifacts.sort();
    artifacts.dedup();
    ctx.artifacts_with_results = artifacts;

    ctx.execution_duration = ctx.query_stats.iter().map(|s| s.duration_ns).sum();

    let expected = ctx
        .query_stats
        .iter()
        .map(|s| s.total_queries)
        .chain([ctx.total_requests, ctx.query_stats.len() as u64])
        .max()
        .unwrap_or(0);
    ctx.total_requests = expected;
    let finished = ctx.query_stats.iter().filter(|s| s.is_terminal()).count() as u64;
    ctx.outstanding_requests = expected.saturating_sub(finished);

    outcome.cancel = ctx.check_quotas();

    let complete =
        stats.flow_complete || (!ctx.query_stats.is_empty() && ctx.outstanding_requests == 0);
    ctx.recompute_state(complete, reported_progress);

    if complete {
        ctx.completion_sent = true;
        outcome.newly_complete = true;
    }
    outcome
}
